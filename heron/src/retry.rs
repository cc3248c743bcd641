use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay schedule for requeued attempts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Requeue immediately.
    None,
    /// Same delay before every attempt.
    Fixed { delay_ms: u64 },
    /// `base_ms * 2^(retry_count - 1)`, capped at `max_ms`.
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base_ms: 2_000,
            max_ms: 300_000, // 5 minutes
        }
    }
}

/// How an exhausted job reaches the dead-letter queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequeueStrategy {
    /// Reject without requeue and let the transport route the message through
    /// the queue's dead-letter binding.
    #[default]
    TransportDeadLetter,
    /// Publish a copy with a death record to the DLQ, then ack the original.
    ExplicitDeadLetter,
}

/// Main-queue retry policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
        }
    }
}

/// What to do with a job whose processing just failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Publish a fresh copy carrying `retry_count` after `delay`.
    Requeue { retry_count: u32, delay: Duration },
    /// Retries are exhausted; `attempts_made` failures were observed.
    DeadLetter { attempts_made: u32 },
}

impl RetryPolicy {
    /// Decide the fate of a job that has now failed `retry_count` times
    /// (the counter already incremented for this failure).
    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        if should_dead_letter(retry_count, self.max_retries) {
            RetryDecision::DeadLetter {
                attempts_made: retry_count,
            }
        } else {
            RetryDecision::Requeue {
                retry_count,
                delay: compute_backoff(retry_count, &self.backoff),
            }
        }
    }
}

/// Computes the delay before attempt `retry_count + 1`.
///
/// Formula for exponential backoff: `min(base * 2^(retry_count - 1), max)`.
pub fn compute_backoff(retry_count: u32, backoff: &Backoff) -> Duration {
    if retry_count == 0 {
        return Duration::ZERO;
    }

    match backoff {
        Backoff::None => Duration::ZERO,
        Backoff::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
        Backoff::Exponential { base_ms, max_ms } => {
            let exp = retry_count.saturating_sub(1).min(63);
            let scaled = base_ms.saturating_mul(1u64.checked_shl(exp).unwrap_or(u64::MAX));
            Duration::from_millis(scaled.min(*max_ms))
        }
    }
}

/// Returns true once `retry_count >= max_retries`.
pub fn should_dead_letter(retry_count: u32, max_retries: u32) -> bool {
    retry_count >= max_retries
}

/// Dead-letter queue re-injection policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetterPolicy {
    pub max_retries: u32,
    pub reinject_delay: Duration,
}

impl Default for DeadLetterPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            reinject_delay: Duration::ZERO,
        }
    }
}

/// Outcome for a dead-lettered job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeadLetterDecision {
    /// Send back to the main queue with a reset retry counter.
    Reinject { dlq_retry_count: u32 },
    /// Ceiling exceeded; the job leaves the system.
    Drop { dlq_retry_count: u32 },
}

impl DeadLetterPolicy {
    /// Decide the fate of a dead-lettered job whose DLQ counter has just been
    /// incremented to `dlq_retry_count`.
    pub fn decide(&self, dlq_retry_count: u32) -> DeadLetterDecision {
        if dlq_retry_count > self.max_retries {
            DeadLetterDecision::Drop { dlq_retry_count }
        } else {
            DeadLetterDecision::Reinject { dlq_retry_count }
        }
    }

    /// Upper bound on processing attempts for a job that never succeeds.
    pub fn total_attempts(&self, retry: &RetryPolicy) -> u32 {
        retry.max_retries.max(1) * (self.max_retries + 1)
    }
}
