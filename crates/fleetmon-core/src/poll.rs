//! Bounded polling
//!
//! Every "wait for remote state" step in the installer goes through
//! [`wait_until`]: service status after a start, Grafana reachability
//! after a restart, database readiness after a drop, data freshness
//! during verification. A probe answering `false` (including "could not
//! reach the service at all") means not-ready-yet and is retried until
//! the deadline.

use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Interval and deadline for one polling loop
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    /// Sleep between probes
    pub interval: Duration,
    /// Total time budget
    pub timeout: Duration,
}

impl Retry {
    /// Create a retry policy
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// A bounded poll ran out of time
#[derive(Error, Debug)]
#[error("timed out after {timeout:?} waiting for {what}")]
pub struct PollTimeout {
    /// What was being awaited
    pub what: String,
    /// The exhausted budget
    pub timeout: Duration,
}

/// Poll `probe` until it answers `true` or the deadline elapses.
///
/// # Errors
/// Returns [`PollTimeout`] naming `what` when the deadline elapses.
pub async fn wait_until<F>(what: &str, retry: Retry, mut probe: F) -> Result<(), PollTimeout>
where
    F: AsyncFnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + retry.timeout;

    loop {
        if probe().await {
            return Ok(());
        }

        if tokio::time::Instant::now() + retry.interval > deadline {
            return Err(PollTimeout {
                what: what.to_string(),
                timeout: retry.timeout,
            });
        }

        debug!(what = %what, "condition not met yet, sleeping");
        tokio::time::sleep(retry.interval).await;
    }
}
