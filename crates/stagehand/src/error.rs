//! Supervisor error types.
//!
//! Every variant is fatal to the current session. The binary maps each class to
//! a distinct process exit code so the outer process manager can pick a backoff
//! per failure class.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::process::ProcessRole;
use crate::session::SessionState;

/// Result type for supervisor operations.
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Exit code for a clean, requested shutdown after the session was running.
pub const EXIT_OK: i32 = 0;

/// Exit code for configuration problems, including a failed `check`.
pub const EXIT_CONFIG: i32 = 2;

/// Errors that end a supervised session.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Runtime directory or identity setup failed.
    #[error("runtime setup failed for {}: {message}", path.display())]
    Setup { path: PathBuf, message: String },

    /// A managed process could not be spawned or died right after spawn.
    #[error("failed to launch {role}: {message}")]
    Launch { role: ProcessRole, message: String },

    /// The compositor never produced an endpoint.
    #[error(
        "no endpoint matching '{pattern}*' appeared in {} after {attempts} attempts (entries: [{}])",
        dir.display(),
        entries.join(", ")
    )]
    DiscoveryTimeout {
        dir: PathBuf,
        pattern: String,
        attempts: u32,
        entries: Vec<String>,
    },

    /// The compositor exited while discovery was still polling.
    #[error("compositor (pid {pid}) exited before creating its endpoint: {status}")]
    CompositorDied { pid: u32, status: String },

    /// The endpoint could not be exposed to the supervisor identity.
    #[error("privilege bridge failed for {}: {message}", endpoint.display())]
    Bridge { endpoint: PathBuf, message: String },

    /// The display server never accepted connections.
    #[error("display server did not accept connections on {addr} after {attempts} attempts ({diagnostics})")]
    ReadinessTimeout {
        addr: String,
        attempts: u32,
        diagnostics: ReadinessDiagnostics,
    },

    /// The one-time environment initialization failed.
    #[error("environment initialization failed: {0}")]
    Initialization(String),

    /// A running session lost a critical component.
    #[error("health check failed for {role}: {reason}")]
    HealthCheck { role: ProcessRole, reason: String },

    /// A shutdown request arrived before the session reached `Running`.
    #[error("interrupted by shutdown request while {0}")]
    Interrupted(SessionState),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            SupervisorError::Io(_) => 1,
            SupervisorError::Config(_) => EXIT_CONFIG,
            SupervisorError::Setup { .. } => 10,
            SupervisorError::Launch { .. } => 11,
            SupervisorError::DiscoveryTimeout { .. } => 12,
            SupervisorError::CompositorDied { .. } => 13,
            SupervisorError::Bridge { .. } => 14,
            SupervisorError::ReadinessTimeout { .. } => 15,
            SupervisorError::Initialization(_) => 16,
            SupervisorError::HealthCheck { .. } => 17,
            SupervisorError::Interrupted(_) => 20,
        }
    }

    /// Short machine-friendly name of the failure class.
    pub fn class(&self) -> &'static str {
        match self {
            SupervisorError::Io(_) => "io",
            SupervisorError::Config(_) => "config",
            SupervisorError::Setup { .. } => "setup",
            SupervisorError::Launch { .. } => "launch",
            SupervisorError::DiscoveryTimeout { .. } => "discovery_timeout",
            SupervisorError::CompositorDied { .. } => "compositor_died",
            SupervisorError::Bridge { .. } => "bridge",
            SupervisorError::ReadinessTimeout { .. } => "readiness_timeout",
            SupervisorError::Initialization(_) => "initialization",
            SupervisorError::HealthCheck { .. } => "health_check",
            SupervisorError::Interrupted(_) => "interrupted",
        }
    }

    pub(crate) fn setup(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        SupervisorError::Setup {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn launch(role: ProcessRole, message: impl fmt::Display) -> Self {
        SupervisorError::Launch {
            role,
            message: message.to_string(),
        }
    }

    pub(crate) fn bridge(endpoint: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        SupervisorError::Bridge {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }
}

/// State captured when the display server never became reachable.
///
/// The three flags separate "crashed before bind", "bridge broken" and
/// "hung during bind".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessDiagnostics {
    pub compositor_alive: bool,
    pub endpoint_exists: bool,
    pub display_server_alive: bool,
}

impl fmt::Display for ReadinessDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "compositor_alive={}, endpoint_exists={}, display_server_alive={}",
            self.compositor_alive, self.endpoint_exists, self.display_server_alive
        )
    }
}
