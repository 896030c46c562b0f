//! Wait-until primitive
//!
//! Every "wait for the cloud to catch up" step (instances registering, a spot request
//! becoming visible) goes through [`Poller`]: call a supplier at a fixed interval until
//! a predicate holds or the timeout elapses.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, warn};

/// Default delay between two supplier calls
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of a poll: the last observed value and whether the predicate held
#[derive(Debug, Clone, PartialEq)]
pub struct PollResult<T> {
    value: Option<T>,
    succeeded: bool,
}

impl<T> PollResult<T> {
    fn success(value: T) -> Self {
        Self {
            value: Some(value),
            succeeded: true,
        }
    }

    fn failure(value: Option<T>) -> Self {
        Self {
            value,
            succeeded: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.succeeded
    }

    pub fn is_failed(&self) -> bool {
        !self.succeeded
    }

    /// Last value the supplier produced, if any call completed
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<T> {
        self.value
    }
}

/// Repeatedly invokes a supplier until a predicate holds or the timeout elapses
#[derive(Debug, Clone, Copy)]
pub struct Poller {
    timeout: Duration,
    retry_after: Duration,
}

impl Poller {
    /// Create a poller with the default retry interval
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            retry_after: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Set the delay between two supplier calls
    pub fn retry_after(mut self, interval: Duration) -> Self {
        self.retry_after = interval;
        self
    }

    /// Poll until `predicate` holds for a supplied value.
    ///
    /// The supplier is called at least once. Supplier errors are logged and count as a miss. A supplier call still running at
    /// the deadline is dropped, so the whole wait takes at most the timeout plus one
    /// retry interval.
    pub async fn poll<T, E, F, Fut, P>(&self, mut supplier: F, predicate: P) -> PollResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
        P: Fn(&T) -> bool,
    {
        let deadline = Instant::now() + self.timeout;
        let mut last = None;
        let mut attempt = 0u32;

        loop {
            // The supplier always gets one call, even with a zero timeout
            let remaining = deadline.saturating_duration_since(Instant::now());
            if attempt > 0 && remaining.is_zero() {
                break;
            }

            attempt += 1;
            match timeout(remaining, supplier()).await {
                Ok(Ok(value)) => {
                    if predicate(&value) {
                        debug!(attempt, "Poll condition met");
                        return PollResult::success(value);
                    }
                    last = Some(value);
                }
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "Poll attempt failed");
                }
                Err(_) => {
                    debug!(attempt, "Poll attempt abandoned at deadline");
                    break;
                }
            }

            sleep(self.retry_after).await;
        }

        debug!(attempts = attempt, timeout = ?self.timeout, "Poll timed out");
        PollResult::failure(last)
    }
}
