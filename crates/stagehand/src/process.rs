//! Managed child processes.
//!
//! Handles spawning the compositor, display server and guest processes under
//! the service identity, tracking them in start order, probing their liveness,
//! and tearing them down in reverse order.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rustix::process::{Pid, test_kill_process};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::error::{SupervisorError, SupervisorResult};
use crate::identity::{Identity, SwitchMethod};

/// Role of a managed process within the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProcessRole {
    Compositor,
    DisplayServer,
    GuestRuntime,
    GuestSession,
    /// The one-shot environment initializer. Never kept in the process table.
    Initializer,
}

impl ProcessRole {
    /// Long-lived roles in the order they are started.
    pub const START_ORDER: [ProcessRole; 4] = [
        ProcessRole::Compositor,
        ProcessRole::DisplayServer,
        ProcessRole::GuestRuntime,
        ProcessRole::GuestSession,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessRole::Compositor => "compositor",
            ProcessRole::DisplayServer => "display-server",
            ProcessRole::GuestRuntime => "guest-runtime",
            ProcessRole::GuestSession => "guest-session",
            ProcessRole::Initializer => "initializer",
        }
    }

    /// Losing a critical process ends the session.
    pub fn is_critical(&self) -> bool {
        matches!(self, ProcessRole::Compositor | ProcessRole::DisplayServer)
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to start one child process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub role: ProcessRole,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Inherited variables to drop before `env` is applied.
    pub env_remove: Vec<String>,
    pub identity: Identity,
    /// Start in a new session with no controlling terminal and with the
    /// standard streams redirected to a log file.
    pub detach: bool,
    pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(role: ProcessRole, program: impl Into<String>, identity: Identity) -> Self {
        Self {
            role,
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            env_remove: Vec::new(),
            identity,
            detach: false,
            cwd: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn detached(mut self) -> Self {
        self.detach = true;
        self
    }
}

/// A child process under supervision.
#[derive(Debug)]
pub struct ManagedProcess {
    pub role: ProcessRole,
    pub pid: u32,
    /// Name of the account the process runs as.
    pub identity: String,
    pub started_at: DateTime<Utc>,
    pub last_observed_alive: Option<DateTime<Utc>>,
    /// Leader of its own process group.
    detached: bool,
    exit_status: Option<ExitStatus>,
    child: Child,
}

impl ManagedProcess {
    /// Wrap a freshly spawned child. Returns `None` if it already has no PID.
    pub fn new(role: ProcessRole, child: Child, identity: impl Into<String>, detached: bool) -> Option<Self> {
        let pid = child.id()?;
        Some(Self {
            role,
            pid,
            identity: identity.into(),
            started_at: Utc::now(),
            last_observed_alive: None,
            detached,
            exit_status: None,
            child,
        })
    }

    /// Check if the process is still running.
    ///
    /// Reaps the child if it exited, then confirms with a signal-0 probe.
    pub fn is_alive(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                return false;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Error checking status of {} (PID {}): {}", self.role, self.pid, e);
                return false;
            }
        }

        if pid_alive(self.pid) {
            self.last_observed_alive = Some(Utc::now());
            true
        } else {
            false
        }
    }

    /// Whether the process leads its own process group.
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Exit status, once the process has been observed to exit.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Human readable exit description for logs and errors.
    pub fn describe_exit(&self) -> String {
        match self.exit_status {
            Some(status) => status.to_string(),
            None => "no exit status observed".to_string(),
        }
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.exit_status = Some(status);
        Ok(status)
    }

    /// Send a signal to the process, or to its whole group when detached.
    pub fn signal(&self, signal: libc::c_int) -> bool {
        let Ok(pid) = libc::pid_t::try_from(self.pid) else {
            return false;
        };
        let target = if self.detached { -pid } else { pid };
        unsafe { libc::kill(target, signal) == 0 }
    }

    /// Terminate the process: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// Always waits for the process to be reaped so no zombie is left behind.
    pub async fn terminate(&mut self, grace: Duration) {
        if !self.is_alive() {
            debug!("{} (PID {}) already exited: {}", self.role, self.pid, self.describe_exit());
            return;
        }

        debug!("Sending SIGTERM to {} (PID {})", self.role, self.pid);
        self.signal(libc::SIGTERM);

        match tokio::time::timeout(grace, self.wait()).await {
            Ok(Ok(status)) => {
                info!("{} (PID {}) exited: {}", self.role, self.pid, status);
                return;
            }
            Ok(Err(e)) => warn!("Error waiting for {} (PID {}): {:?}", self.role, self.pid, e),
            Err(_) => warn!(
                "{} (PID {}) did not exit within {:?}, sending SIGKILL",
                self.role, self.pid, grace
            ),
        }

        self.signal(libc::SIGKILL);
        if let Err(e) = self.child.kill().await {
            if self.is_alive() {
                warn!("Failed to kill {} (PID {}): {}", self.role, self.pid, e);
            }
        }
        match tokio::time::timeout(Duration::from_secs(5), self.wait()).await {
            Ok(_) => info!("{} (PID {}) killed", self.role, self.pid),
            Err(_) => warn!("Timeout waiting for {} (PID {}) to exit", self.role, self.pid),
        }
    }
}

/// Signal-0 probe. EPERM still means the process exists.
pub fn pid_alive(pid: u32) -> bool {
    let Some(pid) = i32::try_from(pid).ok().and_then(Pid::from_raw) else {
        return false;
    };
    match test_kill_process(pid) {
        Ok(()) => true,
        Err(e) => e == rustix::io::Errno::PERM,
    }
}

/// Table of the session's managed processes, kept in start order.
#[derive(Debug, Default)]
pub struct ProcessTable {
    entries: Vec<ManagedProcess>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a process. Replaces an existing entry with the same role.
    pub fn insert(&mut self, process: ManagedProcess) {
        if let Some(old) = self.remove(process.role) {
            warn!("Replacing tracked {} (PID {})", old.role, old.pid);
        }
        self.entries.push(process);
    }

    pub fn get(&self, role: ProcessRole) -> Option<&ManagedProcess> {
        self.entries.iter().find(|p| p.role == role)
    }

    pub fn get_mut(&mut self, role: ProcessRole) -> Option<&mut ManagedProcess> {
        self.entries.iter_mut().find(|p| p.role == role)
    }

    pub fn remove(&mut self, role: ProcessRole) -> Option<ManagedProcess> {
        let index = self.entries.iter().position(|p| p.role == role)?;
        Some(self.entries.remove(index))
    }

    pub fn pid(&self, role: ProcessRole) -> Option<u32> {
        self.get(role).map(|p| p.pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManagedProcess> {
        self.entries.iter()
    }

    pub fn roles(&self) -> Vec<ProcessRole> {
        self.entries.iter().map(|p| p.role).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Probe one role. Untracked roles count as dead.
    pub fn is_alive(&mut self, role: ProcessRole) -> bool {
        self.get_mut(role).is_some_and(|p| p.is_alive())
    }

    /// Liveness of every tracked process, for diagnostics.
    pub fn liveness(&mut self) -> BTreeMap<ProcessRole, bool> {
        self.entries
            .iter_mut()
            .map(|p| (p.role, p.is_alive()))
            .collect()
    }

    /// Terminate every tracked process in reverse start order.
    pub async fn shutdown(&mut self, grace: Duration) {
        if self.entries.is_empty() {
            return;
        }
        info!("Stopping {} managed processes", self.entries.len());

        while let Some(mut process) = self.entries.pop() {
            process.terminate(grace).await;
        }
    }
}

/// Starts child processes. The seam between the pipeline and the OS.
#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(&self, spec: &LaunchSpec) -> SupervisorResult<ManagedProcess>;
}

/// Spawns real OS processes, switching identity as needed.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    /// Identity the supervisor runs as.
    current: Identity,
    use_sudo: bool,
    /// Detached children write their output here, one file per role.
    log_dir: PathBuf,
}

impl CommandSpawner {
    pub fn new(current: Identity, use_sudo: bool, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            current,
            use_sudo,
            log_dir: log_dir.into(),
        }
    }

    fn build_command(&self, spec: &LaunchSpec) -> SupervisorResult<Command> {
        let method = SwitchMethod::select(&self.current, &spec.identity, self.use_sudo)
            .map_err(|e| SupervisorError::launch(spec.role, e))?;

        let mut cmd = match method {
            SwitchMethod::None => {
                debug!("Spawning {} as current user: {:?}", spec.program, spec.args);
                let mut cmd = Command::new(&spec.program);
                cmd.args(&spec.args);
                cmd
            }
            SwitchMethod::Setuid => {
                debug!(
                    "Spawning {} as user '{}' via setuid: {:?}",
                    spec.program, spec.identity.name, spec.args
                );
                let groups = supplementary_groups(&spec.identity)
                    .map_err(|e| SupervisorError::launch(spec.role, format!("resolving groups: {e}")))?;
                let (uid, gid) = (spec.identity.uid, spec.identity.gid);

                let mut cmd = Command::new(&spec.program);
                cmd.args(&spec.args)
                    .env("HOME", &spec.identity.home)
                    .env("USER", &spec.identity.name)
                    .env("LOGNAME", &spec.identity.name);
                // Command::uid/gid would clear the supplementary groups.
                unsafe {
                    cmd.pre_exec(move || switch_identity(&groups, uid, gid));
                }
                cmd
            }
            SwitchMethod::Sudo => {
                debug!(
                    "Spawning {} as user '{}' via sudo: {:?}",
                    spec.program, spec.identity.name, spec.args
                );
                let mut cmd = Command::new("sudo");
                cmd.arg("-n")
                    .arg("-u")
                    .arg(&spec.identity.name)
                    .arg("--preserve-env")
                    .arg("--")
                    .arg(&spec.program)
                    .args(&spec.args);
                cmd
            }
        };

        for key in &spec.env_remove {
            cmd.env_remove(key);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);

        if spec.detach {
            let (stdout, stderr) = self.log_files(spec.role)?;
            cmd.stdout(stdout).stderr(stderr);
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        } else {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        Ok(cmd)
    }

    fn log_files(&self, role: ProcessRole) -> SupervisorResult<(Stdio, Stdio)> {
        fs::create_dir_all(&self.log_dir)
            .map_err(|e| SupervisorError::setup(&self.log_dir, format!("creating log dir: {e}")))?;
        let path = self.log_dir.join(format!("{role}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| SupervisorError::setup(&path, format!("opening log file: {e}")))?;
        let clone = file
            .try_clone()
            .map_err(|e| SupervisorError::setup(&path, format!("cloning log file: {e}")))?;
        Ok((Stdio::from(file), Stdio::from(clone)))
    }
}

#[async_trait]
impl Spawner for CommandSpawner {
    async fn spawn(&self, spec: &LaunchSpec) -> SupervisorResult<ManagedProcess> {
        info!(
            "Spawning {} as '{}': {} {}",
            spec.role,
            spec.identity.name,
            spec.program,
            spec.args.join(" ")
        );

        let mut cmd = self.build_command(spec)?;
        let mut child = cmd
            .spawn()
            .map_err(|e| SupervisorError::launch(spec.role, format!("spawning {}: {e}", spec.program)))?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(spec.role, "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(spec.role, "stderr", stderr);
        }

        let process = ManagedProcess::new(spec.role, child, spec.identity.name.clone(), spec.detach)
            .ok_or_else(|| SupervisorError::launch(spec.role, "failed to get PID"))?;

        info!("{} spawned with PID {}", spec.role, process.pid);
        Ok(process)
    }
}

/// Full group list of `identity`, as `initgroups` would set it.
///
/// Resolved in the parent: NSS lookups are not safe between fork and exec.
pub fn supplementary_groups(identity: &Identity) -> std::io::Result<Vec<libc::gid_t>> {
    let name = CString::new(identity.name.as_str())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "user name contains NUL"))?;

    let mut capacity: libc::c_int = 32;
    loop {
        let mut groups: Vec<libc::gid_t> = vec![0; capacity as usize];
        let mut count = capacity;
        let found = unsafe { libc::getgrouplist(name.as_ptr(), identity.gid, groups.as_mut_ptr(), &mut count) };
        if found >= 0 {
            groups.truncate(count as usize);
            return Ok(groups);
        }
        if capacity >= 65536 {
            return Err(std::io::Error::other(format!("too many groups for '{}'", identity.name)));
        }
        capacity = count.max(capacity * 2);
    }
}

/// Drop to `uid`/`gid` keeping `groups`. Runs in the child before exec.
fn switch_identity(groups: &[libc::gid_t], uid: u32, gid: u32) -> std::io::Result<()> {
    unsafe {
        if libc::setgroups(groups.len(), groups.as_ptr()) != 0
            || libc::setgid(gid) != 0
            || libc::setuid(uid) != 0
        {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Forward a child's output into the log stream, one line per record.
fn forward_output<R>(role: ProcessRole, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(target: "stagehand::child", "[{role} {stream}] {line}"),
                Ok(None) => break,
                Err(e) => {
                    debug!("Stopped reading {} {}: {}", role, stream, e);
                    break;
                }
            }
        }
    });
}
