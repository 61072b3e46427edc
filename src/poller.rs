//! # Readiness Poller
//!
//! Bounded, fixed-interval wait-until-ready primitive. A caller-supplied probe
//! is invoked until it reports `Probe::Ready`, a fatal error, or the attempt
//! budget runs out. Transient probe errors (for example an eventually
//! consistent listing that does not know the instance yet) count as "not
//! ready" and are absorbed here; they never escape to the caller.
//!
//! The poller checks first and sleeps only *between* attempts, so a probe
//! that is ready on call `k + 1` returns right away without a trailing sleep,
//! and a probe that is never ready is called exactly `max_attempts` times.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::NotReadyError;

/// Errors a probe may raise that should be treated as "not ready yet".
pub trait TransientError {
    fn is_transient(&self) -> bool;
}

/// Outcome of a single probe invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Ready(T),
    NotReady,
}

/// Poll budget: how often and how many times to ask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    /// Total probe invocations, including the first (minimum 1).
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: crate::defaults::POLL_INTERVAL,
            max_attempts: crate::defaults::POLL_ATTEMPTS,
        }
    }
}

impl PollConfig {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Upper bound on the time spent sleeping.
    pub fn ceiling(&self) -> Duration {
        self.interval * self.attempts().saturating_sub(1)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Why polling stopped without a ready result.
#[derive(Debug)]
pub enum PollError<E> {
    Exhausted(NotReadyError),
    Fatal(E),
}

impl<E: std::fmt::Display> std::fmt::Display for PollError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::Exhausted(err) => write!(f, "{}", err),
            PollError::Fatal(err) => write!(f, "{}", err),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for PollError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PollError::Exhausted(err) => Some(err),
            PollError::Fatal(err) => Some(err),
        }
    }
}

/// Invoke `probe` until it is ready, fails fatally, or the budget is spent.
///
/// `what` names the condition being waited for and ends up in both the log
/// lines and the `NotReadyError`.
pub async fn poll_until_ready<F, Fut, T, E>(
    what: &str,
    config: &PollConfig,
    mut probe: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe<T>, E>>,
    E: TransientError + std::fmt::Display,
{
    let max_attempts = config.attempts();
    let started = Instant::now();
    info!(what, max_attempts, interval = ?config.interval, "Waiting");

    for attempt in 1..=max_attempts {
        match probe().await {
            Ok(Probe::Ready(value)) => {
                info!(what, attempt, elapsed = ?started.elapsed(), "Ready");
                return Ok(value);
            }
            Ok(Probe::NotReady) => {
                debug!(what, attempt, "Not ready yet");
            }
            Err(err) if err.is_transient() => {
                debug!(what, attempt, error = %err, "Transient probe error, treating as not ready");
            }
            Err(err) => {
                warn!(what, attempt, error = %err, "Probe failed (non-retryable)");
                return Err(PollError::Fatal(err));
            }
        }

        if attempt < max_attempts {
            sleep(config.interval).await;
        }
    }

    let waited = started.elapsed();
    warn!(what, attempts = max_attempts, ?waited, "Gave up waiting");
    Err(PollError::Exhausted(NotReadyError {
        what: what.to_string(),
        attempts: max_attempts,
        waited,
    }))
}
