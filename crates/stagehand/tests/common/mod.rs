//! Test utilities and common setup.

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use stagehand::config::CommandSpec;
use stagehand::{
    CommandSpawner, Identity, LaunchSpec, ManagedProcess, ProcessRole, Spawner, Supervisor, SupervisorConfig,
    SupervisorResult,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Compositor that creates its endpoint after a short delay and stays up.
pub const COMPOSITOR_OK: &str = r#"sleep 0.2; : > "$XDG_RUNTIME_DIR/wayland-1"; exec sleep 60"#;

/// Compositor that never creates an endpoint.
pub const COMPOSITOR_SILENT: &str = "exec sleep 60";

/// What the fake display server does when launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayBehavior {
    /// Bind the configured port, then idle.
    Listen,
    /// Idle without ever binding.
    Hang,
    /// Bind the configured port, but the process itself has already exited.
    Exited,
}

/// Wraps the real spawner, counting launches per role.
///
/// The display server is replaced by `sleep` plus a listener owned by the
/// test process, so no real remote-display binary is needed.
pub struct CountingSpawner {
    inner: CommandSpawner,
    display: DisplayBehavior,
    port: u16,
    calls: Mutex<BTreeMap<ProcessRole, u32>>,
    pids: Mutex<BTreeMap<ProcessRole, u32>>,
    listeners: Mutex<Vec<TcpListener>>,
}

impl CountingSpawner {
    pub fn new(inner: CommandSpawner, display: DisplayBehavior, port: u16) -> Self {
        Self {
            inner,
            display,
            port,
            calls: Mutex::new(BTreeMap::new()),
            pids: Mutex::new(BTreeMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self, role: ProcessRole) -> u32 {
        self.calls.lock().unwrap().get(&role).copied().unwrap_or(0)
    }

    /// PID of the most recent launch of `role`.
    pub fn pid(&self, role: ProcessRole) -> Option<u32> {
        self.pids.lock().unwrap().get(&role).copied()
    }

    async fn spawn_display(&self, spec: &LaunchSpec) -> SupervisorResult<ManagedProcess> {
        if self.display != DisplayBehavior::Hang {
            let listener = TcpListener::bind(("127.0.0.1", self.port)).unwrap();
            self.listeners.lock().unwrap().push(listener);
        }

        let mut fake = spec.clone();
        if self.display == DisplayBehavior::Exited {
            fake.program = "true".to_string();
            fake.args.clear();
            let mut process = self.inner.spawn(&fake).await?;
            process.wait().await.unwrap();
            return Ok(process);
        }
        fake.program = "sleep".to_string();
        fake.args = vec!["60".to_string()];
        self.inner.spawn(&fake).await
    }
}

#[async_trait]
impl Spawner for CountingSpawner {
    async fn spawn(&self, spec: &LaunchSpec) -> SupervisorResult<ManagedProcess> {
        *self.calls.lock().unwrap().entry(spec.role).or_default() += 1;

        let process = if spec.role == ProcessRole::DisplayServer {
            self.spawn_display(spec).await?
        } else {
            self.inner.spawn(spec).await?
        };
        self.pids.lock().unwrap().insert(spec.role, process.pid);
        Ok(process)
    }
}

/// A port nothing is listening on.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn shell(script: &str) -> CommandSpec {
    CommandSpec::new("sh", &["-c", script])
}

/// A temporary installation: runtime directories, state and marker.
pub struct Harness {
    pub root: TempDir,
    pub config: SupervisorConfig,
}

impl Harness {
    pub fn new(compositor_script: &str) -> Self {
        let root = TempDir::new().unwrap();
        let path = |name: &str| root.path().join(name).display().to_string();

        let mut config = SupervisorConfig::default();
        config.service_user = Identity::current().unwrap().name;
        config.use_sudo = false;
        config.runtime.dir_pattern = path("service");
        config.runtime.supervisor_dir = Some(path("supervisor"));
        config.runtime.state_dir = path("state");

        config.compositor.command = shell(compositor_script);
        config.display.bind_address = "127.0.0.1".to_string();
        config.display.bind_port = free_port();

        config.guest.init_command = shell("sleep 0.3");
        config.guest.full_install_args = vec![];
        config.guest.marker_path = path("state/initialized");
        config.guest.runtime_command = shell("exec sleep 60");
        config.guest.session_command = shell("exec sleep 60");

        let t = &mut config.timing;
        t.discovery_interval_ms = 50;
        t.discovery_attempts = 40;
        t.readiness_interval_ms = 50;
        t.readiness_attempts = 20;
        t.probe_timeout_ms = 200;
        t.init_timeout_secs = 10;
        t.bridge_retry_ms = 20;
        t.guest_settle_ms = 100;
        t.health_interval_ms = 100;
        t.shutdown_grace_ms = 300;

        Self { root, config }
    }

    pub fn service_dir(&self) -> PathBuf {
        self.root.path().join("service")
    }

    pub fn supervisor_dir(&self) -> PathBuf {
        self.root.path().join("supervisor")
    }

    pub fn marker(&self) -> PathBuf {
        self.root.path().join("state").join("initialized")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.path().join("state")
    }

    /// Build a supervisor running everything as the current user.
    pub fn supervisor(
        &self,
        display: DisplayBehavior,
        cancel: CancellationToken,
    ) -> (Supervisor, Arc<CountingSpawner>) {
        let me = Identity::current().unwrap();
        let inner = CommandSpawner::new(me.clone(), false, self.root.path().join("state").join("logs"));
        let spawner = Arc::new(CountingSpawner::new(inner, display, self.config.display.bind_port));
        let supervisor = Supervisor::new(self.config.clone(), me.clone(), me, spawner.clone(), cancel);
        (supervisor, spawner)
    }
}
