//! On-disk record of the session's children.
//!
//! Detached children outlive a supervisor that is killed outright and keep
//! holding the display port. Every tracked child is written to the state
//! directory, and the next start terminates whatever from that record is still
//! running before anything new is spawned.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::process::{ProcessTable, pid_alive};

pub const REGISTRY_FILE: &str = "children.json";

/// One recorded child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRecord {
    pub role: String,
    pub pid: u32,
    /// Leader of its own process group.
    pub detached: bool,
    /// Kernel start time, used to tell our process from a reused PID.
    pub start_ticks: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ChildRegistry {
    path: PathBuf,
}

impl ChildRegistry {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join(REGISTRY_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records from the last write. Missing or unreadable files yield none.
    pub fn load(&self) -> Vec<ChildRecord> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!("Could not read {}: {}", self.path.display(), e);
                return Vec::new();
            }
        };
        serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!("Ignoring malformed {}: {}", self.path.display(), e);
            Vec::new()
        })
    }

    /// Replace the record with the current contents of `table`.
    pub fn record(&self, table: &ProcessTable) -> io::Result<()> {
        let records: Vec<ChildRecord> = table
            .iter()
            .map(|p| ChildRecord {
                role: p.role.as_str().to_string(),
                pid: p.pid,
                detached: p.is_detached(),
                start_ticks: start_ticks(p.pid),
            })
            .collect();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(&records).map_err(io::Error::other)?;
        let partial = self.path.with_extension("json.partial");
        fs::write(&partial, body)?;
        fs::rename(&partial, &self.path)
    }

    pub fn clear(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", self.path.display(), e),
        }
    }

    /// Terminate recorded children that are still running.
    ///
    /// SIGTERM first, SIGKILL for whatever is left after `grace`. Returns the
    /// number of leftovers found. The record is removed afterwards.
    pub async fn reap(&self, grace: Duration) -> usize {
        let targets: Vec<(ChildRecord, libc::pid_t)> = self
            .load()
            .into_iter()
            .filter_map(|record| leftover_target(&record).map(|target| (record, target)))
            .collect();

        for (record, target) in &targets {
            info!(
                "Terminating leftover {} from a previous run (PID {})",
                record.role, record.pid
            );
            send(*target, libc::SIGTERM);
        }

        let deadline = Instant::now() + grace;
        while targets.iter().any(|(_, t)| target_alive(*t)) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for (record, target) in &targets {
            if target_alive(*target) {
                warn!(
                    "Leftover {} (PID {}) ignored SIGTERM, sending SIGKILL",
                    record.role, record.pid
                );
                send(*target, libc::SIGKILL);
            }
        }

        self.clear();
        targets.len()
    }
}

/// Signal target for a record that still has something running, if any.
///
/// Negative targets address the whole process group.
fn leftover_target(record: &ChildRecord) -> Option<libc::pid_t> {
    let pid = libc::pid_t::try_from(record.pid).ok().filter(|pid| *pid > 1)?;

    if pid_alive(record.pid) {
        let current = start_ticks(record.pid);
        if record.start_ticks.is_none() || current != record.start_ticks {
            debug!("PID {} no longer belongs to the recorded {}, leaving it alone", record.pid, record.role);
            return None;
        }
        return Some(if record.detached { -pid } else { pid });
    }

    // A group id is not handed out again while the group has members.
    if record.detached && target_alive(-pid) {
        return Some(-pid);
    }
    None
}

fn send(target: libc::pid_t, signal: libc::c_int) {
    unsafe {
        libc::kill(target, signal);
    }
}

fn target_alive(target: libc::pid_t) -> bool {
    unsafe { libc::kill(target, 0) == 0 }
}

/// Start time of `pid` in clock ticks since boot, from `/proc/<pid>/stat`.
pub fn start_ticks(pid: u32) -> Option<u64> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Field 2 is the parenthesized command name and may contain spaces.
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(19)?.parse().ok()
}
