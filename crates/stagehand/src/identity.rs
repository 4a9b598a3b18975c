//! Linux identities the supervisor launches processes under.
//!
//! The supervisor itself usually runs as root while the compositor, display
//! server and guest run as a dedicated unprivileged account. Account data is
//! resolved through `id` and `getent` so NSS-backed users work too.

use std::fmt;
use std::path::PathBuf;
use std::process::Command;

use log::{debug, warn};
use rustix::process::{getegid, geteuid};

use crate::error::{SupervisorError, SupervisorResult};

/// A resolved OS account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

impl Identity {
    /// Resolve an account by name.
    pub fn resolve(name: &str) -> SupervisorResult<Self> {
        let uid = id_number(&["-u", name])?
            .ok_or_else(|| SupervisorError::Config(format!("unknown user '{name}'")))?;
        let gid = id_number(&["-g", name])?
            .ok_or_else(|| SupervisorError::Config(format!("no primary group for '{name}'")))?;
        let home = passwd_home(name).unwrap_or_else(|| PathBuf::from("/"));

        debug!("Resolved user '{}' to uid={} gid={}", name, uid, gid);
        Ok(Self {
            name: name.to_string(),
            uid,
            gid,
            home,
        })
    }

    /// The identity the supervisor is running as.
    pub fn current() -> SupervisorResult<Self> {
        let uid = geteuid().as_raw();
        let gid = getegid().as_raw();
        let name = match command_stdout("id", &["-un"]) {
            Some(name) => name,
            None => {
                warn!("Could not resolve name of uid {}, using numeric id", uid);
                uid.to_string()
            }
        };
        let home = passwd_home(&name)
            .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("/"));

        Ok(Self {
            name,
            uid,
            gid,
            home,
        })
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (uid {})", self.name, self.uid)
    }
}

/// How a child gets moved from the supervisor identity to its target identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchMethod {
    /// Target is the supervisor's own identity.
    None,
    /// Supervisor is root; the child drops privileges with setuid/setgid.
    Setuid,
    /// Supervisor is unprivileged; the child is wrapped in `sudo -n -u`.
    Sudo,
}

impl SwitchMethod {
    /// Decide how to run as `target` when the supervisor is `current`.
    pub fn select(current: &Identity, target: &Identity, use_sudo: bool) -> SupervisorResult<Self> {
        if current.uid == target.uid {
            Ok(SwitchMethod::None)
        } else if current.is_root() {
            Ok(SwitchMethod::Setuid)
        } else if use_sudo {
            Ok(SwitchMethod::Sudo)
        } else {
            Err(SupervisorError::Config(format!(
                "cannot run as '{}': supervisor is '{}', not root, and use_sudo is false",
                target.name, current.name
            )))
        }
    }
}

/// Check that the supervisor can actually switch to `target`.
pub fn check_privileges(current: &Identity, target: &Identity, use_sudo: bool) -> SupervisorResult<()> {
    if SwitchMethod::select(current, target, use_sudo)? != SwitchMethod::Sudo {
        return Ok(());
    }

    let output = Command::new("sudo")
        .args(["-n", "true"])
        .output()
        .map_err(|e| SupervisorError::Config(format!("checking sudo availability: {e}")))?;

    if !output.status.success() {
        warn!(
            "sudo requires a password; launching processes as '{}' will fail. \
             Run as root or allow NOPASSWD sudo for the supervisor account.",
            target.name
        );
    }
    Ok(())
}

fn id_number(args: &[&str]) -> SupervisorResult<Option<u32>> {
    let output = Command::new("id")
        .args(args)
        .output()
        .map_err(|e| SupervisorError::Config(format!("running id {args:?}: {e}")))?;

    if !output.status.success() {
        return Ok(None);
    }

    let text = String::from_utf8_lossy(&output.stdout);
    text.trim()
        .parse::<u32>()
        .map(Some)
        .map_err(|e| SupervisorError::Config(format!("parsing output of id {args:?}: {e}")))
}

fn passwd_home(name: &str) -> Option<PathBuf> {
    let line = command_stdout("getent", &["passwd", name])?;
    parse_passwd_home(&line)
}

fn parse_passwd_home(line: &str) -> Option<PathBuf> {
    let parts: Vec<&str> = line.trim().split(':').collect();
    if parts.len() >= 6 && !parts[5].is_empty() {
        Some(PathBuf::from(parts[5]))
    } else {
        None
    }
}

fn command_stdout(cmd: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(cmd).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() { None } else { Some(text) }
}
