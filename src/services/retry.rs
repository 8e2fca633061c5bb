//! Retry and dead-letter decisions.
//!
//! Failures are classified by the executor:
//! - **Transient**: retried with exponential backoff until the binding's
//!   `max_attempts` is reached, then dead-lettered
//! - **Permanent**: failed immediately, never retried

use rand::Rng;
use std::time::Duration;

use crate::services::executor::ExecutionError;
use crate::services::topology::QueueBinding;

/// What to do with a job whose execution failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Re-publish after `delay`; the job returns to `QUEUED`.
    Retry { delay: Duration },
    /// Attempts exhausted: DLQ, `DEAD_LETTERED`.
    DeadLetter,
    /// Non-retryable: DLQ, `FAILED`.
    Fail,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Upper bound of the random multiplicative jitter, in `[0, 1]`.
    jitter: f64,
    max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            jitter: 0.1,
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(jitter: f64, max_backoff: Duration) -> Self {
        Self {
            jitter: jitter.clamp(0.0, 1.0),
            max_backoff,
        }
    }

    /// Longest delay a retry can be scheduled with.
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Decide the fate of `attempt` (1-based, already counted) after `error`.
    pub fn decide(
        &self,
        binding: &QueueBinding,
        attempt: u32,
        error: &ExecutionError,
    ) -> RetryDecision {
        match error {
            ExecutionError::Permanent(_) => RetryDecision::Fail,
            ExecutionError::Transient(_) if attempt >= binding.max_attempts => {
                RetryDecision::DeadLetter
            }
            ExecutionError::Transient(_) => {
                let sample = rand::rng().random_range(0.0..=self.jitter);
                RetryDecision::Retry {
                    delay: self.backoff(binding, attempt, sample),
                }
            }
        }
    }

    /// `base * 2^(attempt-1) * (1 + jitter_sample)`, capped at `max_backoff`.
    ///
    /// With `jitter_sample <= 1` the delay never decreases as `attempt` grows.
    pub fn backoff(&self, binding: &QueueBinding, attempt: u32, jitter_sample: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let base = (binding.base_backoff().as_millis() as u64).saturating_mul(1u64 << exponent);
        let jittered = base as f64 * (1.0 + jitter_sample.clamp(0.0, self.jitter));
        let capped = jittered.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}
