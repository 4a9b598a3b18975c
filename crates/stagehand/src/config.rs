//! Supervisor configuration.
//!
//! All knobs that the pipeline reads live in [`SupervisorConfig`], which is loaded
//! once at startup, validated, and then passed by reference to every stage.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SupervisorError, SupervisorResult};

/// Rendering mode for the compositor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RenderingMode {
    /// Software rendering fallback (no GPU).
    #[default]
    Software,
    /// Hardware rendering with vendor-specific driver overrides.
    Hardware { vendor: String },
}

impl FromStr for RenderingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("software") {
            return Ok(RenderingMode::Software);
        }
        match s.split_once(':') {
            Some((kind, vendor)) if kind.eq_ignore_ascii_case("hardware") => {
                let vendor = vendor.trim().to_ascii_lowercase();
                if vendor.is_empty() {
                    Err("hardware rendering mode needs a vendor, e.g. hardware:amd".to_string())
                } else {
                    Ok(RenderingMode::Hardware { vendor })
                }
            }
            _ => Err(format!(
                "unknown rendering mode '{s}' (expected 'software' or 'hardware:<vendor>')"
            )),
        }
    }
}

impl TryFrom<String> for RenderingMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RenderingMode> for String {
    fn from(mode: RenderingMode) -> Self {
        mode.to_string()
    }
}

impl fmt::Display for RenderingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderingMode::Software => f.write_str("software"),
            RenderingMode::Hardware { vendor } => write!(f, "hardware:{vendor}"),
        }
    }
}

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Top-level supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Unprivileged account that runs the compositor, display server and guest.
    pub service_user: String,
    /// Use sudo to switch to the service user when not running as root.
    pub use_sudo: bool,
    pub runtime: RuntimeDirConfig,
    pub compositor: CompositorConfig,
    pub display: DisplayConfig,
    pub guest: GuestConfig,
    pub timing: TimingConfig,
    pub logging: LoggingConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            service_user: "stagehand".to_string(),
            use_sudo: true,
            runtime: RuntimeDirConfig::default(),
            compositor: CompositorConfig::default(),
            display: DisplayConfig::default(),
            guest: GuestConfig::default(),
            timing: TimingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeDirConfig {
    /// Per-identity runtime directory. `{uid}` and `{user}` are substituted.
    pub dir_pattern: String,
    /// Explicit runtime directory for the supervisor's own identity.
    /// Defaults to `dir_pattern` applied to the supervisor identity.
    pub supervisor_dir: Option<String>,
    /// State directory; detached children log to `<state_dir>/logs`.
    pub state_dir: String,
}

impl Default for RuntimeDirConfig {
    fn default() -> Self {
        Self {
            dir_pattern: "/run/user/{uid}".to_string(),
            supervisor_dir: None,
            state_dir: "/var/lib/stagehand".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    pub command: CommandSpec,
    pub rendering_mode: RenderingMode,
    /// File name prefix of the endpoint the compositor creates.
    pub endpoint_prefix: String,
    /// Variable through which clients are told the endpoint name.
    pub endpoint_env: String,
    /// Extra environment, applied after the rendering-mode defaults.
    pub env: BTreeMap<String, String>,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            command: CommandSpec::new("sway", &[]),
            rendering_mode: RenderingMode::Software,
            endpoint_prefix: "wayland-".to_string(),
            endpoint_env: "WAYLAND_DISPLAY".to_string(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// `{bind_address}` and `{bind_port}` in args are substituted.
    pub command: CommandSpec,
    pub bind_address: String,
    pub bind_port: u16,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            command: CommandSpec::new("wayvnc", &["{bind_address}", "{bind_port}"]),
            bind_address: "0.0.0.0".to_string(),
            bind_port: 5900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestConfig {
    pub init_command: CommandSpec,
    /// Appended to `init_command` when `full_install` is set.
    pub full_install_args: Vec<String>,
    pub full_install: bool,
    /// Written only after `init_command` exits successfully.
    pub marker_path: String,
    pub runtime_command: CommandSpec,
    pub session_command: CommandSpec,
    /// Run the guest runtime as the supervisor identity, attached through the
    /// bridged endpoint, instead of as the service user.
    pub runtime_as_supervisor: bool,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            init_command: CommandSpec::new("waydroid", &["init"]),
            full_install_args: vec!["-s".to_string(), "GAPPS".to_string()],
            full_install: false,
            marker_path: "/var/lib/stagehand/initialized".to_string(),
            runtime_command: CommandSpec::new("waydroid", &["container", "start"]),
            session_command: CommandSpec::new("waydroid", &["session", "start"]),
            runtime_as_supervisor: false,
        }
    }
}

/// Polling intervals and deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub discovery_interval_ms: u64,
    pub discovery_attempts: u32,
    pub readiness_interval_ms: u64,
    pub readiness_attempts: u32,
    /// Connect timeout of a single TCP probe.
    pub probe_timeout_ms: u64,
    pub init_timeout_secs: u64,
    pub bridge_retry_ms: u64,
    /// Delay before the guest runtime is checked and the session started.
    pub guest_settle_ms: u64,
    pub health_interval_ms: u64,
    /// Time each child gets between SIGTERM and SIGKILL.
    pub shutdown_grace_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            discovery_interval_ms: 1000,
            discovery_attempts: 30,
            readiness_interval_ms: 1000,
            readiness_attempts: 10,
            probe_timeout_ms: 500,
            init_timeout_secs: 15 * 60,
            bridge_retry_ms: 250,
            guest_settle_ms: 500,
            health_interval_ms: 10_000,
            shutdown_grace_ms: 2000,
        }
    }
}

impl TimingConfig {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn bridge_retry(&self) -> Duration {
        Duration::from_millis(self.bridge_retry_ms)
    }

    pub fn guest_settle(&self) -> Duration {
        Duration::from_millis(self.guest_settle_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl SupervisorConfig {
    /// Validate the configuration once at startup.
    pub fn validate(&self) -> SupervisorResult<()> {
        let invalid = |msg: String| Err(SupervisorError::Config(msg));

        if self.service_user.trim().is_empty() {
            return invalid("service_user must not be empty".into());
        }
        if self.runtime.dir_pattern.trim().is_empty() {
            return invalid("runtime.dir_pattern must not be empty".into());
        }
        if self.compositor.endpoint_prefix.is_empty() {
            return invalid("compositor.endpoint_prefix must not be empty".into());
        }
        if self.compositor.endpoint_prefix.contains('/') {
            return invalid("compositor.endpoint_prefix must be a file name prefix".into());
        }
        if self.compositor.endpoint_env.trim().is_empty() {
            return invalid("compositor.endpoint_env must not be empty".into());
        }
        if self.display.bind_port == 0 {
            return invalid("display.bind_port must be non-zero".into());
        }
        if self.display.bind_address.parse::<IpAddr>().is_err() {
            return invalid(format!(
                "display.bind_address '{}' is not an IP address",
                self.display.bind_address
            ));
        }
        if self.guest.marker_path.trim().is_empty() {
            return invalid("guest.marker_path must not be empty".into());
        }

        for (name, command) in self.commands() {
            if command.program.trim().is_empty() {
                return invalid(format!("{name}.program must not be empty"));
            }
        }

        let t = &self.timing;
        let intervals = [
            ("timing.discovery_interval_ms", t.discovery_interval_ms),
            ("timing.readiness_interval_ms", t.readiness_interval_ms),
            ("timing.probe_timeout_ms", t.probe_timeout_ms),
            ("timing.init_timeout_secs", t.init_timeout_secs),
            ("timing.health_interval_ms", t.health_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return invalid(format!("{name} must be non-zero"));
            }
        }
        if t.discovery_attempts == 0 || t.readiness_attempts == 0 {
            return invalid("timing attempt counts must be non-zero".into());
        }

        Ok(())
    }

    /// Every external command the supervisor may run, keyed by config path.
    pub fn commands(&self) -> Vec<(&'static str, &CommandSpec)> {
        vec![
            ("compositor.command", &self.compositor.command),
            ("display.command", &self.display.command),
            ("guest.init_command", &self.guest.init_command),
            ("guest.runtime_command", &self.guest.runtime_command),
            ("guest.session_command", &self.guest.session_command),
        ]
    }

    /// Expand `~` in path-like settings.
    pub fn expand_paths(&mut self) {
        let tilde = |s: &str| shellexpand::tilde(s).to_string();
        self.runtime.state_dir = tilde(&self.runtime.state_dir);
        self.runtime.supervisor_dir = self.runtime.supervisor_dir.as_deref().map(tilde);
        self.guest.marker_path = tilde(&self.guest.marker_path);
        for command in [
            &mut self.compositor.command,
            &mut self.display.command,
            &mut self.guest.init_command,
            &mut self.guest.runtime_command,
            &mut self.guest.session_command,
        ] {
            command.program = tilde(&command.program);
        }
    }

    /// Check if a binary exists in PATH or as an absolute path.
    pub fn binary_exists(binary: &str) -> bool {
        if Path::new(binary).is_absolute() {
            Path::new(binary).exists()
        } else {
            std::process::Command::new("which")
                .arg(binary)
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or(false)
        }
    }
}
