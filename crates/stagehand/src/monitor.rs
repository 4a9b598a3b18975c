//! Health monitoring of a running session.

use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{SupervisorError, SupervisorResult};
use crate::poll::port_accepting;
use crate::process::{ProcessRole, ProcessTable};
use crate::session::{Session, SessionState};

/// Periodic liveness and reachability checks.
///
/// Critical components (compositor, display server and its port) end the
/// session when they fail. A guest process exiting only degrades it.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    pub addr: SocketAddr,
    pub interval: Duration,
    pub probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(addr: SocketAddr, interval: Duration, probe_timeout: Duration) -> Self {
        Self {
            addr,
            interval,
            probe_timeout,
        }
    }

    /// One round of checks.
    pub async fn tick(&self, table: &mut ProcessTable, session: &mut Session) -> SupervisorResult<()> {
        for role in [ProcessRole::Compositor, ProcessRole::DisplayServer] {
            if !table.is_alive(role) {
                let reason = match table.get(role) {
                    Some(process) => format!("process {} exited: {}", process.pid, process.describe_exit()),
                    None => "not tracked".to_string(),
                };
                return Err(SupervisorError::HealthCheck { role, reason });
            }
        }

        if !port_accepting(self.addr, self.probe_timeout).await {
            return Err(SupervisorError::HealthCheck {
                role: ProcessRole::DisplayServer,
                reason: format!("{} not accepting connections", self.addr),
            });
        }

        for role in [ProcessRole::GuestRuntime, ProcessRole::GuestSession] {
            let Some(process) = table.get_mut(role) else {
                continue;
            };
            if process.is_alive() {
                continue;
            }
            warn!(
                "{} (PID {}) exited: {}; session degraded",
                role,
                process.pid,
                process.describe_exit()
            );
            table.remove(role);
            session.transition(SessionState::Degraded);
        }

        debug!("Health check passed ({} processes tracked)", table.len());
        Ok(())
    }

    /// Check every `interval` until a critical failure or cancellation.
    ///
    /// Returns `Ok(())` when cancelled. The first check runs one interval
    /// after the call.
    pub async fn run(
        &self,
        table: &mut ProcessTable,
        session: &mut Session,
        cancel: &CancellationToken,
    ) -> SupervisorResult<()> {
        info!("Monitoring session health every {:?} ({})", self.interval, self.addr);

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Health monitor stopping");
                    return Ok(());
                }
                _ = ticker.tick() => self.tick(table, session).await?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::net::TcpListener;
    use tokio::process::Command;

    use crate::process::ManagedProcess;

    fn spawn(role: ProcessRole, script: &str) -> ManagedProcess {
        let child = Command::new("sh")
            .args(["-c", script])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        ManagedProcess::new(role, child, "test", false).unwrap()
    }

    async fn running_session() -> (ProcessTable, Session, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut table = ProcessTable::new();
        for role in ProcessRole::START_ORDER {
            table.insert(spawn(role, "sleep 30"));
        }
        let mut session = Session::new();
        for state in [
            SessionState::LaunchingCompositor,
            SessionState::WaitingForEndpoint,
            SessionState::LaunchingDisplayServer,
            SessionState::WaitingForReadiness,
            SessionState::Initializing,
        ] {
            session.transition(state);
        }
        for role in ProcessRole::START_ORDER {
            session.confirm_alive(role);
        }
        session.mark_running().unwrap();
        (table, session, listener)
    }

    fn monitor(listener: &TcpListener) -> HealthMonitor {
        HealthMonitor::new(
            listener.local_addr().unwrap(),
            Duration::from_millis(50),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_tick_passes_when_healthy() {
        let (mut table, mut session, listener) = running_session().await;
        monitor(&listener).tick(&mut table, &mut session).await.unwrap();
        assert_eq!(session.state(), SessionState::Running);
        table.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_compositor_death_fails_within_one_tick() {
        let (mut table, mut session, listener) = running_session().await;
        table
            .get_mut(ProcessRole::Compositor)
            .unwrap()
            .terminate(Duration::from_millis(200))
            .await;

        let cancel = CancellationToken::new();
        let err = tokio::time::timeout(
            Duration::from_secs(2),
            monitor(&listener).run(&mut table, &mut session, &cancel),
        )
        .await
        .unwrap()
        .unwrap_err();

        assert!(matches!(
            err,
            SupervisorError::HealthCheck {
                role: ProcessRole::Compositor,
                ..
            }
        ));
        table.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_display_server_death_fails() {
        let (mut table, mut session, listener) = running_session().await;
        table
            .get_mut(ProcessRole::DisplayServer)
            .unwrap()
            .terminate(Duration::from_millis(200))
            .await;

        let err = monitor(&listener).tick(&mut table, &mut session).await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::HealthCheck {
                role: ProcessRole::DisplayServer,
                ..
            }
        ));
        table.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_closed_port_fails() {
        let (mut table, mut session, listener) = running_session().await;
        let health = monitor(&listener);
        drop(listener);

        let err = health.tick(&mut table, &mut session).await.unwrap_err();
        assert!(matches!(err, SupervisorError::HealthCheck { reason, .. } if reason.contains("not accepting")));
        table.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_guest_exit_degrades() {
        let (mut table, mut session, listener) = running_session().await;
        table
            .get_mut(ProcessRole::GuestSession)
            .unwrap()
            .terminate(Duration::from_millis(200))
            .await;

        monitor(&listener).tick(&mut table, &mut session).await.unwrap();
        assert_eq!(session.state(), SessionState::Degraded);
        assert!(table.get(ProcessRole::GuestSession).is_none());
        assert!(table.get(ProcessRole::GuestRuntime).is_some());
        table.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_run_returns_ok_on_cancel() {
        let (mut table, mut session, listener) = running_session().await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            trigger.cancel();
        });

        monitor(&listener)
            .run(&mut table, &mut session, &cancel)
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Running);
        table.shutdown(Duration::from_millis(200)).await;
    }
}
