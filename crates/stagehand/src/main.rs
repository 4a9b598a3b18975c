use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, error, info, warn};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use stagehand::config::RenderingMode;
use stagehand::guest::InitializationMarker;
use stagehand::runtime_dir::runtime_dir_path;
use stagehand::{EXIT_CONFIG, EXIT_OK, Identity, Supervisor, SupervisorConfig, SupervisorError};

const APP_NAME: &str = "stagehand";

fn main() {
    match try_main() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            let _ = writeln!(io::stderr(), "{err:?}");
            let code = err
                .downcast_ref::<SupervisorError>()
                .map(SupervisorError::exit_code)
                .unwrap_or(1);
            std::process::exit(code);
        }
    }
}

fn try_main() -> Result<i32> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    for notice in &ctx.notices {
        warn!("{}", notice);
    }
    debug!("config file: {}", ctx.config_file.display());

    match cli.command {
        Command::Run(cmd) => async_run(ctx, cmd),
        Command::Check => handle_check(&ctx),
        Command::Config { command } => handle_config(&ctx, command).map(|()| EXIT_OK),
        Command::Completions { shell } => handle_completions(shell).map(|()| EXIT_OK),
    }
}

#[tokio::main]
async fn async_run(ctx: RuntimeContext, cmd: RunCommand) -> Result<i32> {
    handle_run(&ctx, cmd).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Stagehand - headless compositor, remote display and guest session supervisor.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", env = "STAGEHAND_CONFIG", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -v)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Log and print machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Include log targets and source locations
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one supervised session until it fails or is stopped
    Run(RunCommand),
    /// Validate configuration, identities and required binaries
    Check,
    /// Inspect or manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct RunCommand {
    /// Compositor rendering mode: software or hardware:<vendor>
    #[arg(long, value_name = "MODE")]
    rendering_mode: Option<RenderingMode>,
    /// Install the full guest payload if initialization runs
    #[arg(long)]
    full_install: bool,
    /// Address the display server binds to
    #[arg(long, value_name = "ADDR")]
    bind_address: Option<String>,
    /// Port the display server binds to
    #[arg(short, long)]
    port: Option<u16>,
}

impl RunCommand {
    fn apply(self, config: &mut SupervisorConfig) {
        if let Some(mode) = self.rendering_mode {
            config.compositor.rendering_mode = mode;
        }
        if self.full_install {
            config.guest.full_install = true;
        }
        if let Some(address) = self.bind_address {
            config.display.bind_address = address;
        }
        if let Some(port) = self.port {
            config.display.bind_port = port;
        }
    }
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    config: SupervisorConfig,
    /// Warnings raised before logging was initialized.
    notices: Vec<String>,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = match common.config.clone() {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };
        let mut notices = Vec::new();
        let config = load_or_init_config(&config_file, &mut notices)?;
        Ok(Self {
            common,
            config_file,
            config,
            notices,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        let level = self.effective_log_level();
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={}", level.as_str().to_lowercase())));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // Fallback for `log` records if the tracing bridge is already taken
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(level);
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.quiet {
            LevelFilter::Error
        } else if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self.config.logging.level.parse().unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

async fn handle_run(ctx: &RuntimeContext, cmd: RunCommand) -> Result<i32> {
    let mut config = ctx.config.clone();
    cmd.apply(&mut config);

    let span = tracing::info_span!(
        "session",
        user = %config.service_user,
        display = %format!("{}:{}", config.display.bind_address, config.display.bind_port),
        rendering = %config.compositor.rendering_mode,
    );

    let cancel = CancellationToken::new();
    let mut supervisor = match Supervisor::from_config(config, cancel.clone()) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!("Cannot start session [{}]: {}", e.class(), e);
            return Ok(e.exit_code());
        }
    };

    let listener = tokio::spawn(shutdown_signal(cancel.clone()));
    let result = supervisor.run().instrument(span).await;
    listener.abort();

    Ok(match result {
        Ok(()) => {
            info!("Session stopped cleanly");
            EXIT_OK
        }
        Err(e) => {
            error!("Session ended [{}]: {} (exit code {})", e.class(), e, e.exit_code());
            e.exit_code()
        }
    })
}

/// Cancel `cancel` on Ctrl+C or SIGTERM.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping session");
    cancel.cancel();
}

#[derive(Debug, Serialize)]
struct CheckReport {
    config_file: PathBuf,
    valid: bool,
    problems: Vec<String>,
    supervisor_user: Option<String>,
    service_user: Option<String>,
    service_runtime_dir: Option<PathBuf>,
    supervisor_runtime_dir: Option<PathBuf>,
    binaries: Vec<(String, String, bool)>,
    marker_path: String,
    marker_present: bool,
}

fn handle_check(ctx: &RuntimeContext) -> Result<i32> {
    let config = &ctx.config;
    let mut problems = Vec::new();

    if let Err(e) = config.validate() {
        problems.push(e.to_string());
    }

    let supervisor = Identity::current().map_err(|e| problems.push(e.to_string())).ok();
    let service = Identity::resolve(&config.service_user)
        .map_err(|e| problems.push(e.to_string()))
        .ok();

    let service_runtime_dir = service
        .as_ref()
        .map(|id| runtime_dir_path(&config.runtime.dir_pattern, id));
    let supervisor_runtime_dir = supervisor.as_ref().map(|id| {
        let pattern = config
            .runtime
            .supervisor_dir
            .as_deref()
            .unwrap_or(&config.runtime.dir_pattern);
        runtime_dir_path(pattern, id)
    });

    let binaries: Vec<(String, String, bool)> = config
        .commands()
        .into_iter()
        .map(|(name, command)| {
            let found = SupervisorConfig::binary_exists(&command.program);
            if !found {
                problems.push(format!("{name}: '{}' not found", command.program));
            }
            (name.to_string(), command.program.clone(), found)
        })
        .collect();

    let marker = InitializationMarker::probe(&config.guest.marker_path);
    let report = CheckReport {
        config_file: ctx.config_file.clone(),
        valid: problems.is_empty(),
        problems,
        supervisor_user: supervisor.map(|id| id.to_string()),
        service_user: service.map(|id| id.to_string()),
        service_runtime_dir,
        supervisor_runtime_dir,
        binaries,
        marker_path: config.guest.marker_path.clone(),
        marker_present: marker.present,
    };

    if ctx.common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serializing check report to JSON")?
        );
    } else {
        print_check_report(&report);
    }

    if report.valid {
        Ok(EXIT_OK)
    } else {
        Ok(EXIT_CONFIG)
    }
}

fn print_check_report(report: &CheckReport) {
    let show = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());
    let show_path = |value: &Option<PathBuf>| {
        value
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string())
    };

    println!("Config file:        {}", report.config_file.display());
    println!("Supervisor user:    {}", show(&report.supervisor_user));
    println!("Service user:       {}", show(&report.service_user));
    println!("Service runtime:    {}", show_path(&report.service_runtime_dir));
    println!("Supervisor runtime: {}", show_path(&report.supervisor_runtime_dir));
    println!(
        "Marker:             {} ({})",
        report.marker_path,
        if report.marker_present { "present" } else { "absent" }
    );
    println!("Binaries:");
    for (name, program, found) in &report.binaries {
        println!("  [{}] {:<22} {}", if *found { "ok" } else { "!!" }, name, program);
    }
    if report.valid {
        println!("All checks passed");
    } else {
        println!("Problems:");
        for problem in &report.problems {
            println!("  - {problem}");
        }
    }
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let output = if ctx.common.json {
                serde_json::to_string_pretty(&ctx.config).context("serializing config to JSON")?
            } else {
                toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
            };
            println!("{output}");
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => write_default_config(&ctx.config_file),
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

/// Load configuration from `config_file` and the environment.
///
/// Runs before logging is set up, so non-fatal problems are pushed onto
/// `notices` for the caller to log once it can.
fn load_or_init_config(config_file: &Path, notices: &mut Vec<String>) -> Result<SupervisorConfig> {
    if !config_file.exists() {
        if let Err(e) = write_default_config(config_file) {
            notices.push(format!(
                "Could not write default config to {}: {:#}",
                config_file.display(),
                e
            ));
        }
    }

    let built = Config::builder()
        .add_source(
            File::from(config_file)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(&env_prefix())
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| SupervisorError::Config(format!("loading {}: {e}", config_file.display())))?;

    let mut config: SupervisorConfig = built
        .try_deserialize()
        .map_err(|e| SupervisorError::Config(format!("parsing {}: {e}", config_file.display())))?;
    config.expand_paths();
    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = SupervisorConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    format!("# Configuration for {APP_NAME}\n# File: {}\n\n", path.display())
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    match path.to_str() {
        Some(text) => {
            let expanded = shellexpand::full(text).context("expanding path")?;
            Ok(PathBuf::from(expanded.to_string()))
        }
        None => Ok(path),
    }
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run_overrides() {
        let cli = Cli::try_parse_from([
            "stagehand",
            "-v",
            "run",
            "--rendering-mode",
            "hardware:amd",
            "--full-install",
            "--port",
            "5901",
        ])
        .unwrap();
        assert_eq!(cli.common.verbose, 1);

        let Command::Run(cmd) = cli.command else {
            panic!("expected run command");
        };
        let mut config = SupervisorConfig::default();
        cmd.apply(&mut config);
        assert_eq!(
            config.compositor.rendering_mode,
            RenderingMode::Hardware { vendor: "amd".into() }
        );
        assert!(config.guest.full_install);
        assert_eq!(config.display.bind_port, 5901);
        assert_eq!(config.display.bind_address, "0.0.0.0");
    }

    #[test]
    fn test_cli_rejects_bad_rendering_mode() {
        assert!(Cli::try_parse_from(["stagehand", "run", "--rendering-mode", "gpu"]).is_err());
    }

    #[test]
    fn test_default_config_written_and_loaded() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = load_or_init_config(&path, &mut Vec::new()).unwrap();
        assert!(path.exists());
        assert!(fs::read_to_string(&path).unwrap().starts_with("# Configuration for stagehand"));
        assert_eq!(config.display.bind_port, SupervisorConfig::default().display.bind_port);
    }

    #[test]
    fn test_unwritable_default_config_is_reported_not_lost() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();
        let path = blocker.join("config.toml");

        let mut notices = Vec::new();
        let config = load_or_init_config(&path, &mut notices).unwrap();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].contains("Could not write default config"));
        assert_eq!(config.display.bind_port, SupervisorConfig::default().display.bind_port);
    }

    #[test]
    fn test_config_file_values_are_loaded() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "service_user = \"kiosk\"\n[timing]\nreadiness_attempts = 3\n",
        )
        .unwrap();

        let config = load_or_init_config(&path, &mut Vec::new()).unwrap();
        assert_eq!(config.service_user, "kiosk");
        assert_eq!(config.timing.readiness_attempts, 3);
        assert_eq!(config.timing.discovery_attempts, 30);
    }

    #[test]
    fn test_invalid_config_maps_to_config_exit_code() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[compositor]\nrendering_mode = \"gpu\"\n").unwrap();

        let err = load_or_init_config(&path, &mut Vec::new()).unwrap_err();
        let code = err.downcast_ref::<SupervisorError>().map(SupervisorError::exit_code);
        assert_eq!(code, Some(2));
    }
}
