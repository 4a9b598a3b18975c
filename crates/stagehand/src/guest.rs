//! Guest environment: one-time initialization and session start.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{SupervisorError, SupervisorResult};
use crate::poll::sleep_or_cancel;
use crate::process::{LaunchSpec, ProcessRole, ProcessTable, Spawner};
use crate::session::{Session, SessionState};

/// Marker whose presence means the environment is already initialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializationMarker {
    pub path: PathBuf,
    pub present: bool,
}

/// Contents written into the marker file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerRecord {
    pub completed_at: DateTime<Utc>,
    pub full_install: bool,
}

impl InitializationMarker {
    /// Look at the marker on disk. A directory at the path counts as present.
    pub fn probe(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let present = fs::symlink_metadata(&path).is_ok();
        Self { path, present }
    }

    /// Create the marker. Only called after the initializer succeeded.
    pub fn record(&mut self, full_install: bool) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let record = MarkerRecord {
            completed_at: Utc::now(),
            full_install,
        };
        let body = serde_json::to_string_pretty(&record).map_err(std::io::Error::other)?;

        let tmp = self.path.with_extension("partial");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        self.present = true;
        Ok(())
    }

    /// Read back the marker contents, if it is a file we wrote.
    pub fn read(path: &Path) -> Option<MarkerRecord> {
        let body = fs::read_to_string(path).ok()?;
        serde_json::from_str(&body).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// Marker present, nothing ran.
    Skipped,
    /// Initializer ran and the marker was written.
    Completed,
}

/// Run the initializer unless the marker is present.
///
/// The command has its own deadline and is never retried. The marker is
/// written only after a zero exit, so a failed or interrupted run leaves no
/// marker behind.
pub async fn initialize_environment(
    spawner: &dyn Spawner,
    spec: &LaunchSpec,
    marker: &mut InitializationMarker,
    full_install: bool,
    deadline: Duration,
    grace: Duration,
    cancel: &CancellationToken,
) -> SupervisorResult<InitOutcome> {
    if marker.present {
        info!(
            "Environment already initialized ({} present), skipping",
            marker.path.display()
        );
        return Ok(InitOutcome::Skipped);
    }

    info!(
        "Initializing environment (full_install={}, deadline {:?}): {} {}",
        full_install,
        deadline,
        spec.program,
        spec.args.join(" ")
    );

    let mut process = spawner
        .spawn(spec)
        .await
        .map_err(|e| SupervisorError::Initialization(format!("starting initializer: {e}")))?;

    let started = std::time::Instant::now();
    let status = tokio::select! {
        status = process.wait() => status,
        _ = tokio::time::sleep(deadline) => {
            error!("Initializer (PID {}) exceeded its deadline of {:?}", process.pid, deadline);
            process.terminate(grace).await;
            return Err(SupervisorError::Initialization(format!(
                "timed out after {deadline:?}"
            )));
        }
        _ = cancel.cancelled() => {
            warn!("Shutdown requested during initialization, stopping initializer");
            process.terminate(grace).await;
            return Err(SupervisorError::Interrupted(SessionState::Initializing));
        }
    };

    let status = status.map_err(|e| SupervisorError::Initialization(format!("waiting for initializer: {e}")))?;
    if !status.success() {
        return Err(SupervisorError::Initialization(format!(
            "initializer exited with {status}"
        )));
    }

    marker
        .record(full_install)
        .map_err(|e| SupervisorError::Initialization(format!("writing marker {}: {e}", marker.path.display())))?;

    info!(
        "Environment initialized in {:?}, marker written to {}",
        started.elapsed(),
        marker.path.display()
    );
    Ok(InitOutcome::Completed)
}

/// Start the guest runtime, then the guest session.
///
/// The runtime must still be alive after `settle` before the session is
/// started. The session is only checked to have been launched; there is no
/// readiness check for it.
pub async fn start_guest(
    spawner: &dyn Spawner,
    table: &mut ProcessTable,
    session: &mut Session,
    runtime_spec: &LaunchSpec,
    session_spec: &LaunchSpec,
    settle: Duration,
    cancel: &CancellationToken,
) -> SupervisorResult<()> {
    let runtime = spawner.spawn(runtime_spec).await?;
    table.insert(runtime);

    if !sleep_or_cancel(settle, cancel).await {
        return Err(SupervisorError::Interrupted(SessionState::Initializing));
    }
    confirm_started(table, session, ProcessRole::GuestRuntime)?;

    let guest_session = spawner.spawn(session_spec).await?;
    table.insert(guest_session);
    confirm_started(table, session, ProcessRole::GuestSession)?;

    Ok(())
}

fn confirm_started(table: &mut ProcessTable, session: &mut Session, role: ProcessRole) -> SupervisorResult<()> {
    let Some(process) = table.get_mut(role) else {
        return Err(SupervisorError::launch(role, "not tracked after spawn"));
    };
    if process.is_alive() {
        session.confirm_alive(role);
        return Ok(());
    }

    let message = format!("exited right after start: {}", process.describe_exit());
    table.remove(role);
    Err(SupervisorError::launch(role, message))
}
