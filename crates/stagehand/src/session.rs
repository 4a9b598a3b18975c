//! Session state.
//!
//! One session exists per supervisor invocation. It is never persisted; a
//! restart always begins with a fresh session at `Stopped`.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use tokio::sync::watch;

use crate::error::{SupervisorError, SupervisorResult};
use crate::process::ProcessRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Stopped,
    LaunchingCompositor,
    WaitingForEndpoint,
    LaunchingDisplayServer,
    WaitingForReadiness,
    Initializing,
    Running,
    Degraded,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Stopped => "stopped",
            SessionState::LaunchingCompositor => "launching compositor",
            SessionState::WaitingForEndpoint => "waiting for endpoint",
            SessionState::LaunchingDisplayServer => "launching display server",
            SessionState::WaitingForReadiness => "waiting for readiness",
            SessionState::Initializing => "initializing",
            SessionState::Running => "running",
            SessionState::Degraded => "degraded",
            SessionState::Failed => "failed",
        }
    }

    /// Whether the session has reached `Running` (possibly degraded since).
    pub fn is_up(&self) -> bool {
        matches!(self, SessionState::Running | SessionState::Degraded)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed)
    }

    /// Allowed transitions. Startup stages advance strictly in order.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (*self, next) {
            (Failed, _) => false,
            (_, Failed) | (_, Stopped) => true,
            (Stopped, LaunchingCompositor)
            | (LaunchingCompositor, WaitingForEndpoint)
            | (WaitingForEndpoint, LaunchingDisplayServer)
            | (LaunchingDisplayServer, WaitingForReadiness)
            | (WaitingForReadiness, Initializing)
            | (Initializing, Running)
            | (Running, Degraded)
            | (Degraded, Running) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The supervised pipeline for one supervisor invocation.
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    started_at: DateTime<Utc>,
    last_error: Option<String>,
    /// Roles observed alive at least once.
    confirmed: BTreeSet<ProcessRole>,
    tx: watch::Sender<SessionState>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Stopped);
        Self {
            state: SessionState::Stopped,
            started_at: Utc::now(),
            last_error: None,
            confirmed: BTreeSet::new(),
            tx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Follow state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Move to `next`. Returns false and keeps the current state if the
    /// transition is not allowed.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition_to(next) {
            warn!("Refusing session transition {} -> {}", self.state, next);
            return false;
        }
        info!("Session: {} -> {}", self.state, next);
        self.state = next;
        self.tx.send_replace(next);
        true
    }

    /// Record that `role` was observed alive.
    pub fn confirm_alive(&mut self, role: ProcessRole) {
        if self.confirmed.insert(role) {
            info!("Confirmed {} alive", role);
        }
    }

    pub fn is_confirmed(&self, role: ProcessRole) -> bool {
        self.confirmed.contains(&role)
    }

    /// Enter `Running`, provided every long-lived role was confirmed alive.
    pub fn mark_running(&mut self) -> SupervisorResult<()> {
        if let Some(missing) = ProcessRole::START_ORDER
            .iter()
            .find(|role| !self.confirmed.contains(role))
        {
            return Err(SupervisorError::launch(*missing, "never confirmed alive"));
        }
        if !self.transition(SessionState::Running) {
            return Err(SupervisorError::launch(
                ProcessRole::GuestSession,
                format!("cannot enter running from {}", self.state),
            ));
        }
        let elapsed = Utc::now() - self.started_at;
        info!("Session running after {} ms", elapsed.num_milliseconds());
        Ok(())
    }

    /// Enter `Failed` and remember why.
    pub fn fail(&mut self, err: &SupervisorError) {
        error!("Session failed while {} [{}]: {}", self.state, err.class(), err);
        self.last_error = Some(err.to_string());
        self.transition(SessionState::Failed);
    }

    /// Enter `Stopped` after a shutdown request.
    pub fn stop(&mut self, reason: Option<&SupervisorError>) {
        if let Some(err) = reason {
            self.last_error = Some(err.to_string());
        }
        self.transition(SessionState::Stopped);
    }
}
