//! Cancellable fixed-interval polling.
//!
//! No readiness notification crosses the privilege boundary, so every wait in
//! the pipeline is a bounded poll that a shutdown request can interrupt.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use log::trace;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::error::{SupervisorError, SupervisorResult};

/// A polling contract: probe every `interval`, at most `max_attempts` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessCheck {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl ReadinessCheck {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Upper bound on the time spent sleeping between attempts.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

/// Result of a single probe.
#[derive(Debug)]
pub enum Probe<T> {
    Ready(T),
    Pending,
    /// Stop polling immediately with this error.
    Abort(SupervisorError),
}

/// Result of a whole polling loop.
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    Exhausted { attempts: u32 },
    Cancelled,
}

/// Run `probe` until it is ready, aborts, the attempts run out, or `cancel` fires.
///
/// The probe receives the 1-based attempt number.
pub async fn poll_until<T, F, Fut>(
    check: &ReadinessCheck,
    cancel: &CancellationToken,
    mut probe: F,
) -> SupervisorResult<PollOutcome<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Probe<T>>,
{
    for attempt in 1..=check.max_attempts {
        if cancel.is_cancelled() {
            return Ok(PollOutcome::Cancelled);
        }

        match probe(attempt).await {
            Probe::Ready(value) => return Ok(PollOutcome::Ready(value)),
            Probe::Abort(err) => return Err(err),
            Probe::Pending => trace!("attempt {}/{} pending", attempt, check.max_attempts),
        }

        if attempt < check.max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(PollOutcome::Cancelled),
                _ = tokio::time::sleep(check.interval) => {}
            }
        }
    }

    Ok(PollOutcome::Exhausted {
        attempts: check.max_attempts,
    })
}

/// Sleep for `duration` unless cancelled first. Returns false when cancelled.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Plain connect-and-close probe.
pub async fn port_accepting(addr: SocketAddr, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Address to probe for a server bound to `bind_address:port`.
///
/// Wildcard binds are probed over loopback.
pub fn probe_addr(bind_address: IpAddr, port: u16) -> SocketAddr {
    let ip = match bind_address {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        other => other,
    };
    SocketAddr::new(ip, port)
}
