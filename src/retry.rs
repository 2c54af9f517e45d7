use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::schema::Job;

/// Delay growth mode applied between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RetryBackoff {
    /// Every retry waits the base delay.
    #[default]
    Fixed,
    /// The n-th retry waits `base * 2^(n-1)`, capped at the maximum delay.
    Exponential,
}

/// Outcome of consulting the retry policy after a failed or expired attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the job, eligible again after the given delay.
    Requeue(Duration),
    /// Retries are exhausted; dead-letter the job.
    DeadLetter,
}

/// A job's retry configuration, detached from the store so the policy can be
/// evaluated (and tested) as a pure function.
///
/// The same policy is consulted for explicit handler failures and for jobs
/// that expired while active, so both paths share one backoff semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of retries allowed after the initial attempt.
    pub limit: u32,
    /// Base delay before a retry becomes eligible.
    pub delay: Duration,
    /// Delay growth mode.
    pub backoff: RetryBackoff,
    /// Widen each delay by a bounded random amount.
    pub jitter: bool,
    /// Upper bound on any computed delay.
    pub delay_max: Duration,
}

impl RetryPolicy {
    /// Extract the policy recorded on a job row.
    pub fn from_job(job: &Job) -> Self {
        Self {
            limit: u32::try_from(job.retry_limit).unwrap_or(0),
            delay: Duration::from_secs(u64::try_from(job.retry_delay_secs).unwrap_or(0)),
            backoff: job.retry_backoff,
            jitter: job.retry_jitter,
            delay_max: Duration::from_secs(u64::try_from(job.retry_delay_max_secs).unwrap_or(0)),
        }
    }

    /// Decide what to do after the attempt numbered `attempt_count` (1-based,
    /// counting the initial attempt) has failed.
    ///
    /// A job with retry limit `R` is requeued while `attempt_count <= R`, so it
    /// runs `R + 1` times in total before dead-lettering.
    pub fn decide(&self, attempt_count: i32) -> RetryDecision {
        let attempt = u32::try_from(attempt_count).unwrap_or(u32::MAX);
        if attempt > self.limit {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::Requeue(self.delay_for(attempt))
        }
    }

    /// Delay before the n-th retry (n = the attempt that just failed).
    fn delay_for(&self, retry: u32) -> Duration {
        let base = self.delay.as_secs();
        let cap = self.delay_max.as_secs();

        let computed = match self.backoff {
            RetryBackoff::Fixed => base,
            RetryBackoff::Exponential => {
                let factor = 1u64
                    .checked_shl(retry.saturating_sub(1))
                    .unwrap_or(u64::MAX);
                base.saturating_mul(factor)
            }
        };
        let capped = computed.min(cap);

        let secs = if self.jitter {
            // widen by up to half the computed delay, still capped
            let widened = capped.saturating_add(rand::thread_rng().gen_range(0..=capped / 2));
            widened.min(cap)
        } else {
            capped
        };

        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(limit: u32, delay: u64, backoff: RetryBackoff) -> RetryPolicy {
        RetryPolicy {
            limit,
            delay: Duration::from_secs(delay),
            backoff,
            jitter: false,
            delay_max: Duration::from_secs(3600),
        }
    }

    #[test]
    fn fixed_backoff_always_waits_the_base_delay() {
        let policy = policy(10, 30, RetryBackoff::Fixed);
        for attempt in 1..=10 {
            assert_eq!(
                policy.decide(attempt),
                RetryDecision::Requeue(Duration::from_secs(30))
            );
        }
    }

    #[test]
    fn exponential_backoff_doubles_per_retry() {
        let policy = policy(10, 4, RetryBackoff::Exponential);
        assert_eq!(
            policy.decide(1),
            RetryDecision::Requeue(Duration::from_secs(4))
        );
        assert_eq!(
            policy.decide(2),
            RetryDecision::Requeue(Duration::from_secs(8))
        );
        assert_eq!(
            policy.decide(5),
            RetryDecision::Requeue(Duration::from_secs(64))
        );
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            delay_max: Duration::from_secs(100),
            ..policy(30, 4, RetryBackoff::Exponential)
        };
        assert_eq!(
            policy.decide(5),
            RetryDecision::Requeue(Duration::from_secs(64))
        );
        assert_eq!(
            policy.decide(6),
            RetryDecision::Requeue(Duration::from_secs(100))
        );
        // huge attempt counts must not overflow
        assert_eq!(
            policy.decide(30),
            RetryDecision::Requeue(Duration::from_secs(100))
        );
    }

    #[test]
    fn jitter_widens_within_bounds() {
        let policy = RetryPolicy {
            jitter: true,
            ..policy(10, 60, RetryBackoff::Fixed)
        };
        for _ in 0..100 {
            let RetryDecision::Requeue(delay) = policy.decide(1) else {
                panic!("expected a requeue");
            };
            assert!(delay >= Duration::from_secs(60));
            assert!(delay <= Duration::from_secs(90));
        }
    }

    #[test]
    fn jittered_delays_respect_the_cap() {
        let policy = RetryPolicy {
            jitter: true,
            delay_max: Duration::from_secs(70),
            ..policy(10, 60, RetryBackoff::Fixed)
        };
        for _ in 0..100 {
            let RetryDecision::Requeue(delay) = policy.decide(1) else {
                panic!("expected a requeue");
            };
            assert!(delay <= Duration::from_secs(70));
        }
    }

    #[test]
    fn retries_exhaust_after_limit_plus_one_attempts() {
        let policy = policy(2, 1, RetryBackoff::Fixed);
        assert!(matches!(policy.decide(1), RetryDecision::Requeue(_)));
        assert!(matches!(policy.decide(2), RetryDecision::Requeue(_)));
        assert_eq!(policy.decide(3), RetryDecision::DeadLetter);
    }

    #[test]
    fn zero_retry_limit_dead_letters_immediately() {
        let policy = policy(0, 1, RetryBackoff::Fixed);
        assert_eq!(policy.decide(1), RetryDecision::DeadLetter);
    }
}
