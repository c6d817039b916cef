//! Bounded retry for workflow activities.

use std::{future::Future, time::Duration};

use rand::Rng;

use super::ActivityError;

/// Retry policy attached to one workflow step.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub first_retry_interval: Duration,
    /// Total attempts, including the first call.
    pub max_attempts: u32,
    /// Multiplier applied to the delay after each retry.
    pub backoff_coefficient: f64,
    /// Upper bound on a single delay.
    pub max_retry_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            first_retry_interval: Duration::from_secs(5),
            max_attempts: 3,
            backoff_coefficient: 1.0,
            max_retry_interval: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Fixed-interval policy.
    pub fn fixed(first_retry_interval: Duration, max_attempts: u32) -> Self {
        Self {
            first_retry_interval,
            max_attempts,
            ..Self::default()
        }
    }

    /// No delay between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::fixed(Duration::ZERO, max_attempts)
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self
            .backoff_coefficient
            .max(1.0)
            .powi(retry.saturating_sub(1) as i32);
        self.first_retry_interval
            .mul_f64(factor)
            .min(self.max_retry_interval)
    }
}

/// Policies for every step of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicies {
    /// File registration.
    pub register: RetryPolicy,
    /// Raw snapshot retrieval.
    pub retrieve: RetryPolicy,
    /// Each chunk transform.
    pub transform: RetryPolicy,
    /// Deployment.
    pub deploy: RetryPolicy,
    /// Each postprocessing branch.
    pub postprocess: RetryPolicy,
    /// Archival.
    pub archive: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            register: RetryPolicy::fixed(Duration::from_secs(5), 3),
            retrieve: RetryPolicy::fixed(Duration::from_secs(5), 3),
            transform: RetryPolicy::fixed(Duration::from_secs(5), 2),
            deploy: RetryPolicy {
                first_retry_interval: Duration::from_secs(10),
                max_attempts: 6,
                backoff_coefficient: 2.0,
                max_retry_interval: Duration::from_secs(120),
            },
            postprocess: RetryPolicy::fixed(Duration::from_secs(5), 2),
            archive: RetryPolicy::fixed(Duration::from_secs(10), 4),
        }
    }
}

impl RetryPolicies {
    /// The same policy for every step.
    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            register: policy.clone(),
            retrieve: policy.clone(),
            transform: policy.clone(),
            deploy: policy.clone(),
            postprocess: policy.clone(),
            archive: policy,
        }
    }
}

/// Outcome of [`call_with_retry`]: the result plus the number of attempts made.
#[derive(Debug)]
pub struct Attempted<T> {
    /// Final result.
    pub result: Result<T, ActivityError>,
    /// Attempts made (at least 1).
    pub attempts: u32,
}

/// Call `op` until it succeeds, fails with a non-transient error, or `policy` runs out of
/// attempts. `op` receives the 1-based attempt number.
pub async fn call_with_retry<T, F, Fut>(step: &str, policy: &RetryPolicy, mut op: F) -> Attempted<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ActivityError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => {
                return Attempted {
                    result: Ok(v),
                    attempts: attempt,
                };
            }
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let base = policy.delay_for(attempt);
                let jitter_ms = if base.is_zero() {
                    0
                } else {
                    rand::rng().random_range(0..=base.as_millis().min(1_000) as u64 / 10)
                };
                let delay = base + Duration::from_millis(jitter_ms);
                tracing::warn!(step, attempt, ?delay, error = %e, "activity failed; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(step, attempt, error = %e, "activity failed");
                return Attempted {
                    result: Err(e),
                    attempts: attempt,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let p = RetryPolicy {
            first_retry_interval: Duration::from_secs(1),
            max_attempts: 5,
            backoff_coefficient: 2.0,
            max_retry_interval: Duration::from_secs(3),
        };
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(2), Duration::from_secs(2));
        assert_eq!(p.delay_for(3), Duration::from_secs(3));
        assert_eq!(p.delay_for(4), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let out = call_with_retry("deploy", &RetryPolicy::immediate(4), |_| async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ActivityError::transient(anyhow::anyhow!("database is locked")))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(out.result.unwrap(), 7);
        assert_eq!(out.attempts, 3);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let out: Attempted<()> = call_with_retry("deploy", &RetryPolicy::immediate(2), |_| async {
            Err(ActivityError::transient(anyhow::anyhow!("unreachable")))
        })
        .await;
        assert!(out.result.is_err());
        assert_eq!(out.attempts, 2);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let out: Attempted<()> = call_with_retry("transform", &RetryPolicy::immediate(5), |_| async {
            Err(ActivityError::DataShape("empty chunk".into()))
        })
        .await;
        assert!(matches!(out.result, Err(ActivityError::DataShape(_))));
        assert_eq!(out.attempts, 1);
    }
}
