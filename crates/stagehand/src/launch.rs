//! Launch specifications for the session's processes.
//!
//! Pure functions from configuration to [`LaunchSpec`]; nothing here spawns.

use std::collections::BTreeMap;
use std::path::Path;

use crate::config::{CommandSpec, CompositorConfig, DisplayConfig, GuestConfig, RenderingMode};
use crate::endpoint::Endpoint;
use crate::identity::Identity;
use crate::process::{LaunchSpec, ProcessRole};

/// Variable naming the runtime directory for clients and compositor.
pub const RUNTIME_DIR_ENV: &str = "XDG_RUNTIME_DIR";

/// Environment for the headless compositor in the given rendering mode.
///
/// Configured extra variables win over the built-in defaults.
pub fn compositor_env(config: &CompositorConfig, runtime_dir: &Path) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let mut set = |k: &str, v: &str| {
        env.insert(k.to_string(), v.to_string());
    };

    set(RUNTIME_DIR_ENV, &runtime_dir.to_string_lossy());
    set("WLR_BACKENDS", "headless");
    set("WLR_LIBINPUT_NO_DEVICES", "1");

    match &config.rendering_mode {
        RenderingMode::Software => {
            set("WLR_RENDERER", "pixman");
            set("WLR_RENDERER_ALLOW_SOFTWARE", "1");
            set("LIBGL_ALWAYS_SOFTWARE", "1");
        }
        RenderingMode::Hardware { vendor } => {
            set("WLR_RENDERER", "gles2");
            match vendor.as_str() {
                "nvidia" => {
                    set("GBM_BACKEND", "nvidia-drm");
                    set("__GLX_VENDOR_LIBRARY_NAME", "nvidia");
                    set("WLR_NO_HARDWARE_CURSORS", "1");
                }
                "amd" => set("MESA_LOADER_DRIVER_OVERRIDE", "radeonsi"),
                "intel" => set("MESA_LOADER_DRIVER_OVERRIDE", "iris"),
                other => set("MESA_LOADER_DRIVER_OVERRIDE", other),
            }
        }
    }

    for (key, value) in &config.env {
        env.insert(key.clone(), value.clone());
    }
    env
}

/// The compositor. No endpoint name is requested; it picks its own.
pub fn compositor_spec(config: &CompositorConfig, identity: &Identity, runtime_dir: &Path) -> LaunchSpec {
    let mut spec = LaunchSpec::new(ProcessRole::Compositor, &config.command.program, identity.clone())
        .args(config.command.args.iter().cloned());
    spec.env = compositor_env(config, runtime_dir);
    spec.env_remove = vec![config.endpoint_env.clone(), "DISPLAY".to_string()];
    spec
}

/// The remote-display server, attached to the original (non-bridged) endpoint.
///
/// It runs as the same identity as the compositor and is detached from the
/// supervisor's process group.
pub fn display_server_spec(
    config: &DisplayConfig,
    endpoint_env: &str,
    identity: &Identity,
    runtime_dir: &Path,
    endpoint: &Endpoint,
) -> LaunchSpec {
    let port = config.bind_port.to_string();
    let args = expand_args(
        &config.command,
        &[
            ("bind_address", config.bind_address.as_str()),
            ("bind_port", port.as_str()),
        ],
    );
    LaunchSpec::new(ProcessRole::DisplayServer, &config.command.program, identity.clone())
        .args(args)
        .env(RUNTIME_DIR_ENV, runtime_dir.to_string_lossy())
        .env(endpoint_env, &endpoint.name)
        .detached()
}

/// The one-shot environment initializer.
pub fn initializer_spec(config: &GuestConfig, identity: &Identity, full_install: bool) -> LaunchSpec {
    let mut spec = LaunchSpec::new(ProcessRole::Initializer, &config.init_command.program, identity.clone())
        .args(config.init_command.args.iter().cloned());
    if full_install {
        spec = spec.args(config.full_install_args.iter().cloned());
    }
    spec
}

/// A guest process (runtime or session) pointed at the endpoint.
///
/// `runtime_dir` must be the directory as seen by `identity`: the service
/// directory for the service user, the supervisor directory (holding the
/// bridge link) for the supervisor.
pub fn guest_spec(
    role: ProcessRole,
    command: &CommandSpec,
    endpoint_env: &str,
    identity: &Identity,
    runtime_dir: &Path,
    endpoint_name: &str,
    detach: bool,
) -> LaunchSpec {
    let spec = LaunchSpec::new(role, &command.program, identity.clone())
        .args(command.args.iter().cloned())
        .env(RUNTIME_DIR_ENV, runtime_dir.to_string_lossy())
        .env(endpoint_env, endpoint_name);
    if detach { spec.detached() } else { spec }
}

/// Substitute `{name}` placeholders in a command's arguments.
pub fn expand_args(command: &CommandSpec, vars: &[(&str, &str)]) -> Vec<String> {
    command
        .args
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{name}}}"), value)
            })
        })
        .collect()
}
