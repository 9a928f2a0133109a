//! Clock and poller.
//!
//! Two polling primitives back every time-bounded expectation:
//!
//! - [`Poller::eventually`]: invoke `f` every `interval` until `predicate`
//!   holds, failing once `timeout` elapses.
//! - [`Poller::consistently`]: invoke `f` every `interval` for `duration`,
//!   failing as soon as `predicate` does not hold.
//!
//! `f` runs on the caller's task; no concurrency is introduced. Time comes
//! from [`tokio::time::Instant`], which is monotonic and can be paused in
//! tests.

use crate::constants::{
    LOG_CONVERGENCE_TIMEOUT, LOG_POLL_INTERVAL, STABILITY_DURATION, STABILITY_POLL_INTERVAL,
    STATE_CONVERGENCE_TIMEOUT, STATE_POLL_INTERVAL,
};
use crate::error::Error;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Monotonic clock used for all harness timing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Clock;

impl Clock {
    /// Current monotonic instant.
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Time elapsed since `start`.
    pub fn since(&self, start: Instant) -> Duration {
        Instant::now().saturating_duration_since(start)
    }
}

/// Polling window: total duration and the gap between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    /// Timeout for `eventually`, observation window for `consistently`.
    pub window: Duration,
    /// Delay between attempts.
    pub interval: Duration,
}

/// Why a poll did not succeed. Carries the last computed value.
#[derive(Debug)]
pub struct PollFailure<T> {
    /// Last value produced by `f`, if any attempt produced one.
    pub last: Option<T>,
    /// Last error produced by `f`, if the final attempt failed.
    pub last_error: Option<Error>,
    /// Number of times `f` was invoked.
    pub attempts: u32,
    /// Wall time spent polling.
    pub elapsed: Duration,
}

impl Poller {
    pub const fn new(window: Duration, interval: Duration) -> Self {
        Self { window, interval }
    }

    /// 60 s / 4 s, for container and sandbox state transitions.
    pub const fn state_transition() -> Self {
        Self::new(STATE_CONVERGENCE_TIMEOUT, STATE_POLL_INTERVAL)
    }

    /// 60 s / 1 s, for log lines to appear.
    pub const fn log_appearance() -> Self {
        Self::new(LOG_CONVERGENCE_TIMEOUT, LOG_POLL_INTERVAL)
    }

    /// 5 s / 1 s, for stability checks.
    pub const fn stability() -> Self {
        Self::new(STABILITY_DURATION, STABILITY_POLL_INTERVAL)
    }

    /// Polls `f` until `predicate` accepts its value or the window closes.
    ///
    /// Errors returned by `f` count as unsatisfied attempts; polling goes on.
    pub async fn eventually<T, F, Fut, P>(
        &self,
        mut f: F,
        mut predicate: P,
    ) -> std::result::Result<T, PollFailure<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::Result<T>>,
        P: FnMut(&T) -> bool,
    {
        let clock = Clock;
        let start = clock.now();
        let mut attempts = 0;
        let mut last = None;
        let mut last_error = None;

        loop {
            attempts += 1;
            match f().await {
                Ok(value) if predicate(&value) => return Ok(value),
                Ok(value) => {
                    last = Some(value);
                    last_error = None;
                }
                Err(err) => last_error = Some(err),
            }

            let elapsed = clock.since(start);
            if elapsed >= self.window {
                return Err(PollFailure {
                    last,
                    last_error,
                    attempts,
                    elapsed,
                });
            }
            tokio::time::sleep(self.interval.min(self.window - elapsed)).await;
        }
    }

    /// Polls `f` for the whole window, failing on the first value the
    /// predicate rejects or the first error `f` returns.
    pub async fn consistently<T, F, Fut, P>(
        &self,
        mut f: F,
        mut predicate: P,
    ) -> std::result::Result<T, PollFailure<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::Result<T>>,
        P: FnMut(&T) -> bool,
    {
        let clock = Clock;
        let start = clock.now();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let value = match f().await {
                Ok(value) if predicate(&value) => value,
                Ok(value) => {
                    return Err(PollFailure {
                        last: Some(value),
                        last_error: None,
                        attempts,
                        elapsed: clock.since(start),
                    });
                }
                Err(err) => {
                    return Err(PollFailure {
                        last: None,
                        last_error: Some(err),
                        attempts,
                        elapsed: clock.since(start),
                    });
                }
            };

            if clock.since(start) >= self.window {
                return Ok(value);
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_windows() {
        assert_eq!(Poller::state_transition().window, Duration::from_secs(60));
        assert_eq!(Poller::state_transition().interval, Duration::from_secs(4));
        assert_eq!(Poller::log_appearance().interval, Duration::from_secs(1));
        assert_eq!(Poller::stability().window, Duration::from_secs(5));
    }
}
