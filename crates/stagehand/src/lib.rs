//! Stagehand supervises a headless compositor, a remote-display server exposing
//! it over the network, and a sandboxed guest environment drawing into it.
//!
//! The pipeline runs across a privilege boundary: the supervisor (usually root)
//! launches everything under an unprivileged service account, bridges the
//! compositor's endpoint into its own runtime directory, and then watches the
//! assembly until something fails or a shutdown is requested. Restart policy
//! belongs to whatever launched the supervisor.

pub mod bridge;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod guest;
pub mod identity;
pub mod launch;
pub mod monitor;
pub mod poll;
pub mod process;
pub mod registry;
pub mod runtime_dir;
pub mod session;
pub mod supervisor;

pub use config::{RenderingMode, SupervisorConfig};
pub use error::{EXIT_CONFIG, EXIT_OK, ReadinessDiagnostics, SupervisorError, SupervisorResult};
pub use identity::Identity;
pub use process::{CommandSpawner, LaunchSpec, ManagedProcess, ProcessRole, Spawner};
pub use session::{Session, SessionState};
pub use supervisor::Supervisor;
