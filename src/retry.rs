use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;

/// Retry policy for a task's worker.
///
/// The worker is invoked once, then up to `max_retries` more times after
/// errors. The wait before retry `n` (0-indexed) is
/// `interval * multiplier^n`, clamped to `max_interval`. The default
/// multiplier of `1.0` keeps the wait constant at `interval`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    pub max_retries: u32,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            max_retries: 0,
            multiplier: 1.0,
        }
    }
}

impl RetryPolicy {
    /// Fixed-interval policy retrying up to `max_retries` times.
    pub fn fixed(interval: Duration, max_retries: u32) -> Self {
        Self {
            interval,
            max_retries,
            ..Default::default()
        }
    }

    /// Replaces out-of-range fields with usable values.
    pub(crate) fn normalized(mut self) -> Self {
        if self.interval.is_zero() {
            self.interval = Duration::from_secs(1);
        }
        if self.max_interval.is_zero() {
            self.max_interval = Duration::from_secs(30);
        }
        if self.multiplier <= 0.0 {
            self.multiplier = 1.0;
        }
        if self.max_interval > Duration::from_secs(150) {
            self.max_interval = Duration::from_secs(150);
        }
        self
    }

    /// Wait before retry number `attempt` (0-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.interval.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Drives an operation through a [`RetryPolicy`], observing cancellation
/// before each attempt and during every retry wait.
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy: policy.normalized(),
        }
    }

    /// Runs `op` until it succeeds or the policy is exhausted.
    ///
    /// `op` receives the 0-indexed attempt number. Returns the final outcome
    /// together with the number of retries actually performed, which never
    /// exceeds `max_retries`. A cancellation observed before an attempt or
    /// during a retry wait yields [`TaskError::Cancelled`].
    pub async fn run<T, F, Fut>(
        &self,
        ctx: &CancellationToken,
        mut op: F,
    ) -> (Result<T, TaskError>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        let mut retries = 0u32;
        loop {
            if ctx.is_cancelled() {
                return (Err(TaskError::Cancelled), retries);
            }

            let err = match op(retries).await {
                Ok(value) => return (Ok(value), retries),
                Err(e) => e,
            };

            if retries >= self.policy.max_retries {
                return (Err(err), retries);
            }

            let wait = self.policy.backoff(retries);
            tokio::select! {
                _ = ctx.cancelled() => {
                    return (Err(TaskError::Cancelled), retries);
                }
                _ = sleep(wait) => {}
            }
            retries += 1;
        }
    }
}
