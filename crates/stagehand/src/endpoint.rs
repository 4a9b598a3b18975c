//! Endpoint discovery.
//!
//! The compositor picks its own endpoint name and creates the socket inside
//! its runtime directory. Discovery only watches for that filesystem side
//! effect, so it works with any compositor that behaves this way.

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::error::{SupervisorError, SupervisorResult};
use crate::poll::{PollOutcome, Probe, ReadinessCheck, poll_until};
use crate::process::ManagedProcess;
use crate::session::SessionState;

/// A communication endpoint created by the compositor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// File name, as passed to clients through the endpoint variable.
    pub name: String,
    pub path: PathBuf,
    /// Account that owns the endpoint.
    pub owner: String,
    pub discovered_at: DateTime<Utc>,
}

impl Endpoint {
    pub fn exists(&self) -> bool {
        fs::symlink_metadata(&self.path).is_ok()
    }
}

/// Naming pattern of endpoint files: `<prefix><suffix>`, never `*.lock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPattern {
    prefix: String,
}

impl EndpointPattern {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Endpoint candidate names.
    pub fn matches(&self, name: &str) -> bool {
        name.len() > self.prefix.len() && name.starts_with(&self.prefix) && !name.ends_with(".lock")
    }

    /// Lock files the compositor keeps next to its endpoint.
    pub fn is_lock(&self, name: &str) -> bool {
        name.starts_with(&self.prefix) && name.ends_with(".lock")
    }
}

/// Names of matching, non-directory entries in `dir`, sorted.
pub fn scan(dir: &Path, pattern: &EndpointPattern) -> std::io::Result<BTreeSet<String>> {
    let mut found = BTreeSet::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !pattern.matches(&name) {
            continue;
        }
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(true) {
            continue;
        }
        found.insert(name);
    }
    Ok(found)
}

/// Describe every entry of `dir` for diagnostics, e.g. `wayland-1 (socket, 0755)`.
pub fn describe_dir(dir: &Path) -> Vec<String> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => return vec![format!("<unreadable: {e}>")],
    };

    let mut described: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            match fs::symlink_metadata(entry.path()) {
                Ok(meta) => {
                    let ft = meta.file_type();
                    let kind = if ft.is_socket() {
                        "socket"
                    } else if ft.is_symlink() {
                        "symlink"
                    } else if ft.is_dir() {
                        "dir"
                    } else if ft.is_file() {
                        "file"
                    } else {
                        "other"
                    };
                    format!("{name} ({kind}, {:04o})", meta.permissions().mode() & 0o7777)
                }
                Err(_) => format!("{name} (vanished)"),
            }
        })
        .collect();
    described.sort();
    described
}

/// Poll `dir` for a new endpoint created by `compositor`.
///
/// Entries in `baseline` existed before the compositor started and are
/// ignored. Fails fast with [`SupervisorError::CompositorDied`] when the
/// compositor exits, and with [`SupervisorError::DiscoveryTimeout`] after
/// the last attempt.
pub async fn discover(
    dir: &Path,
    pattern: &EndpointPattern,
    baseline: &BTreeSet<String>,
    owner: &str,
    compositor: &mut ManagedProcess,
    check: &ReadinessCheck,
    cancel: &CancellationToken,
) -> SupervisorResult<Endpoint> {
    info!(
        "Waiting for endpoint '{}*' in {} (up to {} attempts every {:?})",
        pattern.prefix(),
        dir.display(),
        check.max_attempts,
        check.interval
    );

    let outcome = poll_until(check, cancel, |attempt| {
        let probe = probe_once(dir, pattern, baseline, compositor, attempt);
        std::future::ready(probe)
    })
    .await?;

    match outcome {
        PollOutcome::Ready(name) => {
            let endpoint = Endpoint {
                path: dir.join(&name),
                name,
                owner: owner.to_string(),
                discovered_at: Utc::now(),
            };
            info!("Discovered endpoint {}", endpoint.path.display());
            Ok(endpoint)
        }
        PollOutcome::Exhausted { attempts } => {
            let entries = describe_dir(dir);
            error!(
                "No endpoint appeared in {} after {} attempts; directory contents:",
                dir.display(),
                attempts
            );
            for entry in &entries {
                error!("  {}", entry);
            }
            Err(SupervisorError::DiscoveryTimeout {
                dir: dir.to_path_buf(),
                pattern: pattern.prefix().to_string(),
                attempts,
                entries,
            })
        }
        PollOutcome::Cancelled => Err(SupervisorError::Interrupted(SessionState::WaitingForEndpoint)),
    }
}

fn probe_once(
    dir: &Path,
    pattern: &EndpointPattern,
    baseline: &BTreeSet<String>,
    compositor: &mut ManagedProcess,
    attempt: u32,
) -> Probe<String> {
    if !compositor.is_alive() {
        return Probe::Abort(SupervisorError::CompositorDied {
            pid: compositor.pid,
            status: compositor.describe_exit(),
        });
    }

    let found = match scan(dir, pattern) {
        Ok(found) => found,
        Err(e) => {
            debug!("attempt {}: cannot read {}: {}", attempt, dir.display(), e);
            return Probe::Pending;
        }
    };

    let mut fresh = found.difference(baseline);
    let Some(first) = fresh.next() else {
        debug!("attempt {}: no endpoint yet", attempt);
        return Probe::Pending;
    };

    let others: Vec<&String> = fresh.collect();
    if !others.is_empty() {
        warn!("Several new endpoints appeared, using '{}' (ignoring {:?})", first, others);
    }
    Probe::Ready(first.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::process::Stdio;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use tokio::process::Command;

    use crate::process::ProcessRole;

    fn pattern() -> EndpointPattern {
        EndpointPattern::new("wayland-")
    }

    fn compositor(script: &str) -> ManagedProcess {
        let child = Command::new("sh")
            .args(["-c", script])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        ManagedProcess::new(ProcessRole::Compositor, child, "test", false).unwrap()
    }

    #[test]
    fn test_pattern_matches() {
        let p = pattern();
        assert!(p.matches("wayland-1"));
        assert!(p.matches("wayland-0"));
        assert!(!p.matches("wayland-"));
        assert!(!p.matches("wayland-1.lock"));
        assert!(!p.matches("pulse"));
        assert!(p.is_lock("wayland-1.lock"));
        assert!(!p.is_lock("wayland-1"));
    }

    #[test]
    fn test_scan_skips_locks_and_dirs() {
        let dir = TempDir::new().unwrap();
        let _socket = UnixListener::bind(dir.path().join("wayland-1")).unwrap();
        fs::write(dir.path().join("wayland-1.lock"), "").unwrap();
        fs::create_dir(dir.path().join("wayland-dir")).unwrap();
        fs::write(dir.path().join("bus"), "").unwrap();

        let found = scan(dir.path(), &pattern()).unwrap();
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec!["wayland-1".to_string()]);
    }

    #[test]
    fn test_describe_dir_reports_kinds() {
        let dir = TempDir::new().unwrap();
        let _socket = UnixListener::bind(dir.path().join("wayland-1")).unwrap();
        fs::create_dir(dir.path().join("pulse")).unwrap();

        let described = describe_dir(dir.path());
        assert_eq!(described.len(), 2);
        assert!(described[0].starts_with("pulse (dir, "));
        assert!(described[1].starts_with("wayland-1 (socket, "));
    }

    #[tokio::test]
    async fn test_discover_finds_new_endpoint() {
        let dir = TempDir::new().unwrap();
        let script = format!("sleep 0.2; : > {}/wayland-1; sleep 30", dir.path().display());
        let mut process = compositor(&script);
        let check = ReadinessCheck::new(Duration::from_millis(50), 40);

        let endpoint = discover(
            dir.path(),
            &pattern(),
            &BTreeSet::new(),
            "tester",
            &mut process,
            &check,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(endpoint.name, "wayland-1");
        assert_eq!(endpoint.path, dir.path().join("wayland-1"));
        assert_eq!(endpoint.owner, "tester");
        assert!(endpoint.exists());
        process.terminate(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_discover_ignores_baseline_entries() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("wayland-0"), "").unwrap();
        let baseline = scan(dir.path(), &pattern()).unwrap();

        let script = format!("sleep 0.1; : > {}/wayland-1; sleep 30", dir.path().display());
        let mut process = compositor(&script);
        let check = ReadinessCheck::new(Duration::from_millis(50), 40);

        let endpoint = discover(
            dir.path(),
            &pattern(),
            &baseline,
            "tester",
            &mut process,
            &check,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(endpoint.name, "wayland-1");
        process.terminate(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_discover_times_out_within_bound() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("unrelated"), "").unwrap();
        let mut process = compositor("sleep 30");
        let check = ReadinessCheck::new(Duration::from_millis(50), 6);

        let start = Instant::now();
        let result = discover(
            dir.path(),
            &pattern(),
            &BTreeSet::new(),
            "tester",
            &mut process,
            &check,
            &CancellationToken::new(),
        )
        .await;
        let elapsed = start.elapsed();

        match result {
            Err(SupervisorError::DiscoveryTimeout {
                attempts, entries, ..
            }) => {
                assert_eq!(attempts, 6);
                assert_eq!(entries.len(), 1);
                assert!(entries[0].starts_with("unrelated (file"));
            }
            other => panic!("expected discovery timeout, got {other:?}"),
        }
        assert!(elapsed < check.interval * (check.max_attempts + 1));
        process.terminate(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_discover_fails_fast_when_compositor_dies() {
        let dir = TempDir::new().unwrap();
        let mut process = compositor("sleep 30");
        let pid = process.pid;
        let interval = Duration::from_millis(100);
        let check = ReadinessCheck::new(interval, 300);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        });

        let start = Instant::now();
        let result = discover(
            dir.path(),
            &pattern(),
            &BTreeSet::new(),
            "tester",
            &mut process,
            &check,
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(SupervisorError::CompositorDied { pid: p, .. }) if p == pid));
        assert!(start.elapsed() < Duration::from_millis(250) + interval * 2);
    }

    #[tokio::test]
    async fn test_discover_honors_cancellation() {
        let dir = TempDir::new().unwrap();
        let mut process = compositor("sleep 30");
        let check = ReadinessCheck::new(Duration::from_secs(10), 30);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = discover(
            dir.path(),
            &pattern(),
            &BTreeSet::new(),
            "tester",
            &mut process,
            &check,
            &cancel,
        )
        .await;
        assert!(matches!(
            result,
            Err(SupervisorError::Interrupted(SessionState::WaitingForEndpoint))
        ));
        process.terminate(Duration::from_secs(1)).await;
    }
}
