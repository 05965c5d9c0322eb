//! Retry intervals and deadlines for transport recovery
//!
//! The transport keeps one [`RetryState`] cursor. Every failed reconnection
//! cycle calls [`increase_timeout`], which picks the delay before the next
//! attempt and doubles the interval up to the configured limit. A successful
//! reconnection resets the cursor with [`RetryState::reset`].
//!
//! ```rust
//! use std::time::Duration;
//! use webcall_core::backoff::{increase_timeout, RetryState};
//!
//! let mut retry = RetryState::new(Duration::from_secs(2), Duration::from_secs(30));
//! increase_timeout(&mut retry);
//!
//! // The delay chosen for this cycle is the old interval plus up to 30% jitter
//! assert!(retry.timeout >= Duration::from_secs(2));
//! assert!(retry.timeout <= Duration::from_millis(2600));
//! assert_eq!(retry.interval, Duration::from_secs(4));
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{ClientError, ClientResult};

/// Maximum jitter added on top of an interval, in percent
pub const JITTER_PERCENT: u32 = 30;

/// Mutable backoff cursor owned by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    /// Base interval for the next cycle
    pub interval: Duration,
    /// Ceiling for `interval`
    pub limit: Duration,
    /// Delay chosen for the current cycle
    pub timeout: Duration,
    base_interval: Duration,
}

impl RetryState {
    pub fn new(interval: Duration, limit: Duration) -> Self {
        let interval = interval.min(limit);
        Self {
            interval,
            limit,
            timeout: interval,
            base_interval: interval,
        }
    }

    /// Back to the base values, used after every successful reconnection
    pub fn reset(&mut self) {
        self.interval = self.base_interval;
        self.timeout = self.base_interval;
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(30))
    }
}

/// Random offset in `[-interval·pct%, +interval·pct%]`, in milliseconds
///
/// Spreads out clients that lost the same server at the same moment.
pub fn jitter(interval: Duration, percent: u32) -> i64 {
    let span = (interval.as_millis() as u64).saturating_mul(percent as u64) / 100;
    if span == 0 {
        return 0;
    }
    let span = span as i64;
    rand::thread_rng().gen_range(-span..=span)
}

/// Advance the backoff cursor by one failed cycle
///
/// `timeout` becomes the current interval plus a non-negative jitter of up to
/// [`JITTER_PERCENT`], so it always lies in `[interval, interval * 1.3]`.
/// `interval` then doubles, never exceeding `limit`.
pub fn increase_timeout(retry: &mut RetryState) -> Duration {
    let base = retry.interval.as_millis() as u64;
    let extra = jitter(retry.interval, JITTER_PERCENT).unsigned_abs();
    retry.timeout = Duration::from_millis(base + extra);

    let doubled = retry.interval.saturating_mul(2);
    retry.interval = doubled.min(retry.limit);
    retry.timeout
}

/// Bound a future with a deadline, turning a hang into `TransportTimeout`
pub async fn with_timeout<T, F>(operation_name: &str, timeout: Duration, future: F) -> ClientResult<T>
where
    F: Future<Output = ClientResult<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => {
            error!(
                operation = operation_name,
                timeout_ms = timeout.as_millis() as u64,
                "Operation timed out"
            );
            Err(ClientError::TransportTimeout {
                operation: operation_name.to_string(),
                duration_ms: timeout.as_millis() as u64,
            })
        }
    }
}
