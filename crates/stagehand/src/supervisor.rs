//! The session pipeline.
//!
//! Brings up the compositor, bridges its endpoint, starts the display server,
//! waits for it to accept connections, initializes the guest environment once
//! and starts the guest. Each stage gates the next. Once running, the health
//! monitor owns the process table until a failure or a shutdown request.

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::bridge::{BridgedEndpoint, bridge_endpoint};
use crate::config::SupervisorConfig;
use crate::endpoint::{Endpoint, EndpointPattern, discover, scan};
use crate::error::{ReadinessDiagnostics, SupervisorError, SupervisorResult};
use crate::guest::{InitializationMarker, initialize_environment, start_guest};
use crate::identity::{Identity, check_privileges};
use crate::launch::{compositor_spec, display_server_spec, guest_spec, initializer_spec};
use crate::monitor::HealthMonitor;
use crate::poll::{PollOutcome, Probe, ReadinessCheck, poll_until, port_accepting, probe_addr};
use crate::process::{CommandSpawner, ProcessRole, ProcessTable, Spawner};
use crate::registry::ChildRegistry;
use crate::runtime_dir::{ensure_runtime_dir, purge_stale_endpoints, purge_stale_links, runtime_dir_path};
use crate::session::{Session, SessionState};

pub struct Supervisor {
    config: SupervisorConfig,
    /// Unprivileged account the pipeline runs under.
    service: Identity,
    /// Account the supervisor itself runs as.
    supervisor: Identity,
    service_dir: PathBuf,
    supervisor_dir: PathBuf,
    spawner: Arc<dyn Spawner>,
    session: Session,
    table: ProcessTable,
    registry: ChildRegistry,
    cancel: CancellationToken,
    endpoint: Option<Endpoint>,
    bridged: Option<BridgedEndpoint>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        service: Identity,
        supervisor: Identity,
        spawner: Arc<dyn Spawner>,
        cancel: CancellationToken,
    ) -> Self {
        let service_dir = runtime_dir_path(&config.runtime.dir_pattern, &service);
        let supervisor_dir = match &config.runtime.supervisor_dir {
            Some(pattern) => runtime_dir_path(pattern, &supervisor),
            None => runtime_dir_path(&config.runtime.dir_pattern, &supervisor),
        };
        let registry = ChildRegistry::new(&config.runtime.state_dir);

        Self {
            config,
            service,
            supervisor,
            service_dir,
            supervisor_dir,
            spawner,
            session: Session::new(),
            table: ProcessTable::new(),
            registry,
            cancel,
            endpoint: None,
            bridged: None,
        }
    }

    /// Build a supervisor for real OS processes from validated configuration.
    pub fn from_config(config: SupervisorConfig, cancel: CancellationToken) -> SupervisorResult<Self> {
        config.validate()?;
        let supervisor = Identity::current()?;
        let service = Identity::resolve(&config.service_user)?;
        check_privileges(&supervisor, &service, config.use_sudo)?;

        info!("Supervisor running as {}, service identity {}", supervisor, service);

        let log_dir = Path::new(&config.runtime.state_dir).join("logs");
        let spawner = CommandSpawner::new(supervisor.clone(), config.use_sudo, log_dir);
        Ok(Self::new(config, service, supervisor, Arc::new(spawner), cancel))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe()
    }

    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn bridged(&self) -> Option<&BridgedEndpoint> {
        self.bridged.as_ref()
    }

    pub fn service_dir(&self) -> &Path {
        &self.service_dir
    }

    pub fn supervisor_dir(&self) -> &Path {
        &self.supervisor_dir
    }

    /// Run one session to completion.
    ///
    /// Returns `Ok(())` only for a requested shutdown after the session reached
    /// `Running`. All children are stopped in reverse start order before this
    /// returns, whatever the outcome.
    pub async fn run(&mut self) -> SupervisorResult<()> {
        let result = match self.start().await {
            Ok(()) => self.monitor().await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => {
                info!("Shutdown requested, stopping session");
                self.session.stop(None);
            }
            Err(e @ SupervisorError::Interrupted(_)) => {
                warn!("{}", e);
                self.log_snapshot().await;
                self.session.stop(Some(e));
            }
            Err(e) => {
                self.log_snapshot().await;
                self.session.fail(e);
            }
        }

        self.table.shutdown(self.config.timing.shutdown_grace()).await;
        self.registry.clear();
        result
    }

    /// Stop every managed process in reverse start order.
    pub async fn shutdown(&mut self) {
        self.table.shutdown(self.config.timing.shutdown_grace()).await;
        self.registry.clear();
        if !self.session.state().is_terminal() {
            self.session.stop(None);
        }
    }

    /// Bring the pipeline up to `Running`.
    ///
    /// Leaves whatever was started in the process table on failure; `run`
    /// tears it down.
    pub async fn start(&mut self) -> SupervisorResult<()> {
        let pattern = EndpointPattern::new(self.config.compositor.endpoint_prefix.clone());
        let timing = self.config.timing.clone();

        // Runtime directories and compositor
        self.session.transition(SessionState::LaunchingCompositor);
        let baseline = self.prepare_runtime_dirs(&pattern).await?;

        let spec = compositor_spec(&self.config.compositor, &self.service, &self.service_dir);
        let compositor = self.spawner.spawn(&spec).await?;
        self.table.insert(compositor);
        self.record_children();

        // Endpoint discovery and bridge
        self.session.transition(SessionState::WaitingForEndpoint);
        let compositor = self
            .table
            .get_mut(ProcessRole::Compositor)
            .ok_or_else(|| SupervisorError::launch(ProcessRole::Compositor, "not tracked after spawn"))?;
        let endpoint = discover(
            &self.service_dir,
            &pattern,
            &baseline,
            &self.service.name,
            compositor,
            &ReadinessCheck::new(timing.discovery_interval(), timing.discovery_attempts),
            &self.cancel,
        )
        .await?;
        self.session.confirm_alive(ProcessRole::Compositor);

        self.endpoint = Some(endpoint.clone());
        let bridged = bridge_endpoint(
            &endpoint,
            &self.supervisor_dir,
            timing.bridge_retry(),
            &self.cancel,
        )
        .await?;
        self.bridged = Some(bridged);

        // Display server
        self.session.transition(SessionState::LaunchingDisplayServer);
        self.ensure_port_free().await?;
        let spec = display_server_spec(
            &self.config.display,
            &self.config.compositor.endpoint_env,
            &self.service,
            &self.service_dir,
            &endpoint,
        );
        let display = self.spawner.spawn(&spec).await?;
        self.table.insert(display);
        self.record_children();

        // Readiness
        self.session.transition(SessionState::WaitingForReadiness);
        self.wait_for_display().await?;
        self.session.confirm_alive(ProcessRole::DisplayServer);

        // Guest environment
        self.session.transition(SessionState::Initializing);
        let full_install = self.config.guest.full_install;
        let mut marker = InitializationMarker::probe(&self.config.guest.marker_path);
        initialize_environment(
            &*self.spawner,
            &initializer_spec(&self.config.guest, &self.service, full_install),
            &mut marker,
            full_install,
            timing.init_timeout(),
            timing.shutdown_grace(),
            &self.cancel,
        )
        .await?;

        let endpoint_env = &self.config.compositor.endpoint_env;
        let (runtime_identity, runtime_dir) = if self.config.guest.runtime_as_supervisor {
            (&self.supervisor, &self.supervisor_dir)
        } else {
            (&self.service, &self.service_dir)
        };
        let runtime_spec = guest_spec(
            ProcessRole::GuestRuntime,
            &self.config.guest.runtime_command,
            endpoint_env,
            runtime_identity,
            runtime_dir,
            &endpoint.name,
            false,
        );
        let session_spec = guest_spec(
            ProcessRole::GuestSession,
            &self.config.guest.session_command,
            endpoint_env,
            &self.service,
            &self.service_dir,
            &endpoint.name,
            false,
        );
        start_guest(
            &*self.spawner,
            &mut self.table,
            &mut self.session,
            &runtime_spec,
            &session_spec,
            timing.guest_settle(),
            &self.cancel,
        )
        .await?;
        self.record_children();

        self.session.mark_running()
    }

    /// Clear out everything a previous run may have left behind, then take
    /// the endpoint baseline.
    async fn prepare_runtime_dirs(&self, pattern: &EndpointPattern) -> SupervisorResult<BTreeSet<String>> {
        let leftovers = self.registry.reap(self.config.timing.shutdown_grace()).await;
        if leftovers > 0 {
            warn!("Terminated {} leftover processes from a previous run", leftovers);
        }

        ensure_runtime_dir(&self.service_dir, &self.service)?;
        purge_stale_endpoints(&self.service_dir, pattern)?;

        if self.supervisor_dir != self.service_dir {
            ensure_runtime_dir(&self.supervisor_dir, &self.supervisor)?;
            purge_stale_links(&self.supervisor_dir, pattern)?;
        }

        scan(&self.service_dir, pattern)
            .map_err(|e| SupervisorError::setup(&self.service_dir, format!("reading: {e}")))
    }

    fn display_addr(&self) -> SupervisorResult<SocketAddr> {
        let ip: IpAddr = self.config.display.bind_address.parse().map_err(|_| {
            SupervisorError::Config(format!(
                "display.bind_address '{}' is not an IP address",
                self.config.display.bind_address
            ))
        })?;
        Ok(probe_addr(ip, self.config.display.bind_port))
    }

    fn record_children(&self) {
        if let Err(e) = self.registry.record(&self.table) {
            warn!("Could not record children in {}: {}", self.registry.path().display(), e);
        }
    }

    /// Refuse to start a display server on a port someone else already serves.
    async fn ensure_port_free(&self) -> SupervisorResult<()> {
        let addr = self.display_addr()?;
        if port_accepting(addr, self.config.timing.probe_timeout()).await {
            return Err(SupervisorError::setup(
                format!("tcp://{addr}"),
                "port already accepting connections before the display server was started",
            ));
        }
        Ok(())
    }

    /// Poll until the display server accepts connections.
    ///
    /// Ready only while the process we started is alive; its exit aborts the wait.
    async fn wait_for_display(&mut self) -> SupervisorResult<()> {
        let addr = self.display_addr()?;
        let timing = &self.config.timing;
        let check = ReadinessCheck::new(timing.readiness_interval(), timing.readiness_attempts);
        let timeout = timing.probe_timeout();
        let table = &mut self.table;

        info!(
            "Waiting for display server on {} (up to {} attempts every {:?})",
            addr, check.max_attempts, check.interval
        );

        let outcome = poll_until(&check, &self.cancel, |_| {
            let exited = display_exit(table);
            async move {
                if let Some(status) = exited {
                    return Probe::Abort(SupervisorError::launch(
                        ProcessRole::DisplayServer,
                        format!("exited before accepting connections: {status}"),
                    ));
                }
                if port_accepting(addr, timeout).await {
                    Probe::Ready(())
                } else {
                    Probe::Pending
                }
            }
        })
        .await?;

        match outcome {
            PollOutcome::Ready(()) => match display_exit(&mut self.table) {
                Some(status) => Err(SupervisorError::launch(
                    ProcessRole::DisplayServer,
                    format!("exited while its port was being probed: {status}"),
                )),
                None => {
                    info!("Display server accepting connections on {}", addr);
                    Ok(())
                }
            },
            PollOutcome::Exhausted { attempts } => Err(SupervisorError::ReadinessTimeout {
                addr: addr.to_string(),
                attempts,
                diagnostics: self.readiness_diagnostics(),
            }),
            PollOutcome::Cancelled => Err(SupervisorError::Interrupted(SessionState::WaitingForReadiness)),
        }
    }

    fn readiness_diagnostics(&mut self) -> ReadinessDiagnostics {
        ReadinessDiagnostics {
            compositor_alive: self.table.is_alive(ProcessRole::Compositor),
            endpoint_exists: self.endpoint.as_ref().is_some_and(Endpoint::exists),
            display_server_alive: self.table.is_alive(ProcessRole::DisplayServer),
        }
    }

    async fn monitor(&mut self) -> SupervisorResult<()> {
        let timing = &self.config.timing;
        let monitor = HealthMonitor::new(self.display_addr()?, timing.health_interval(), timing.probe_timeout());
        monitor.run(&mut self.table, &mut self.session, &self.cancel).await
    }

    /// Log what was alive and what existed at the moment of failure.
    async fn log_snapshot(&mut self) {
        error!("Session snapshot ({}):", self.session.state());
        for (role, alive) in self.table.liveness() {
            let pid = self.table.pid(role).unwrap_or_default();
            error!("  {:<15} pid={:<8} alive={}", role.as_str(), pid, alive);
        }
        if self.table.is_empty() {
            error!("  no managed processes");
        }
        match &self.endpoint {
            Some(endpoint) => error!("  endpoint {} exists={}", endpoint.path.display(), endpoint.exists()),
            None => error!("  endpoint not discovered"),
        }
        if let Some(bridged) = &self.bridged {
            error!(
                "  bridge link {} exists={}",
                bridged.link.display(),
                bridged.link.exists()
            );
        }
        error!(
            "  marker {} present={}",
            self.config.guest.marker_path,
            Path::new(&self.config.guest.marker_path).exists()
        );
    }
}

/// Exit description of the display server, or `None` while it is running.
fn display_exit(table: &mut ProcessTable) -> Option<String> {
    match table.get_mut(ProcessRole::DisplayServer) {
        Some(process) => {
            if process.is_alive() {
                None
            } else {
                Some(process.describe_exit())
            }
        }
        None => Some("not tracked".to_string()),
    }
}
