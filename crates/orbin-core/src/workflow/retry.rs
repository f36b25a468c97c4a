//! Retry policy engine: backoff delay and attempt eligibility.
//!
//! Stateless and deterministic. Attempts are 1-based: attempt 1 runs
//! immediately, attempt `n >= 2` waits
//! `min(initial_interval * backoff_coefficient^(n-2), max_interval)`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use orbin_types::workflow::RetryPolicy;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A retry policy that violates its parameter constraints.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryPolicyError {
    #[error("max_attempts must be >= 1 (got {0})")]
    MaxAttempts(u32),

    #[error("backoff_coefficient must be a finite number >= 1 (got {0})")]
    BackoffCoefficient(f64),

    #[error("max_interval_ms ({max}) must be >= initial_interval_ms ({initial})")]
    MaxInterval { initial: u64, max: u64 },
}

// ---------------------------------------------------------------------------
// Policy functions
// ---------------------------------------------------------------------------

/// Check a policy's parameter constraints.
pub fn validate(policy: &RetryPolicy) -> Result<(), RetryPolicyError> {
    if policy.max_attempts < 1 {
        return Err(RetryPolicyError::MaxAttempts(policy.max_attempts));
    }
    if !policy.backoff_coefficient.is_finite() || policy.backoff_coefficient < 1.0 {
        return Err(RetryPolicyError::BackoffCoefficient(
            policy.backoff_coefficient,
        ));
    }
    if policy.max_interval_ms < policy.initial_interval_ms {
        return Err(RetryPolicyError::MaxInterval {
            initial: policy.initial_interval_ms,
            max: policy.max_interval_ms,
        });
    }
    Ok(())
}

/// Delay to wait before starting `attempt`.
///
/// Saturates at `max_interval_ms`; large exponents never overflow.
pub fn next_attempt_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }

    let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
    let raw = policy.initial_interval_ms as f64 * policy.backoff_coefficient.powi(exponent);
    let cap = policy.max_interval_ms as f64;

    let millis = if raw.is_finite() && raw < cap {
        raw as u64
    } else {
        policy.max_interval_ms
    };
    Duration::from_millis(millis)
}

/// Whether another attempt is allowed after `attempt` failed.
pub fn is_retryable(policy: &RetryPolicy, attempt: u32) -> bool {
    attempt < policy.max_attempts
}

/// Wall-clock time at which `attempt` becomes due, counting from `now`.
pub fn retry_at(policy: &RetryPolicy, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    let delay = next_attempt_delay(policy, attempt);
    let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32, coefficient: f64, initial: u64, max: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_coefficient: coefficient,
            initial_interval_ms: initial,
            max_interval_ms: max,
        }
    }

    // -----------------------------------------------------------------------
    // next_attempt_delay
    // -----------------------------------------------------------------------

    #[test]
    fn test_first_attempt_has_no_delay() {
        let p = RetryPolicy::default();
        assert_eq!(next_attempt_delay(&p, 1), Duration::ZERO);
        assert_eq!(next_attempt_delay(&p, 0), Duration::ZERO);
    }

    #[test]
    fn test_delay_grows_exponentially_until_capped() {
        let p = RetryPolicy::default(); // 1s initial, x2, 60s cap
        let observed: Vec<u64> = (2..=9)
            .map(|n| next_attempt_delay(&p, n).as_millis() as u64)
            .collect();
        assert_eq!(
            observed,
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 60_000, 60_000]
        );
    }

    #[test]
    fn test_delay_matches_formula_across_policies() {
        let policies = [
            policy(5, 1.0, 500, 500),
            policy(5, 3.0, 100, 10_000),
            policy(10, 1.5, 200, 1_000),
            policy(4, 2.0, 0, 0),
        ];
        for p in &policies {
            for n in 2..12u32 {
                let expected = (p.initial_interval_ms as f64
                    * p.backoff_coefficient.powi(n as i32 - 2))
                .min(p.max_interval_ms as f64) as u64;
                assert_eq!(
                    next_attempt_delay(p, n).as_millis() as u64,
                    expected,
                    "policy {p:?}, attempt {n}"
                );
            }
        }
    }

    #[test]
    fn test_huge_attempt_saturates_at_max_interval() {
        let p = policy(3, 10.0, 1_000, 30_000);
        assert_eq!(next_attempt_delay(&p, u32::MAX), Duration::from_millis(30_000));
    }

    // -----------------------------------------------------------------------
    // is_retryable
    // -----------------------------------------------------------------------

    #[test]
    fn test_retryable_until_budget_exhausted() {
        for max in 1..6u32 {
            let p = policy(max, 2.0, 10, 100);
            assert!(!is_retryable(&p, max));
            if max > 1 {
                assert!(is_retryable(&p, max - 1));
            }
        }
    }

    #[test]
    fn test_single_attempt_policy_never_retries() {
        let p = policy(1, 2.0, 10, 100);
        assert!(!is_retryable(&p, 1));
    }

    // -----------------------------------------------------------------------
    // validate
    // -----------------------------------------------------------------------

    #[test]
    fn test_default_policy_is_valid() {
        assert!(validate(&RetryPolicy::default()).is_ok());
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let err = validate(&policy(0, 2.0, 10, 100)).unwrap_err();
        assert_eq!(err, RetryPolicyError::MaxAttempts(0));
    }

    #[test]
    fn test_coefficient_below_one_rejected() {
        assert!(matches!(
            validate(&policy(3, 0.5, 10, 100)),
            Err(RetryPolicyError::BackoffCoefficient(_))
        ));
        assert!(matches!(
            validate(&policy(3, f64::NAN, 10, 100)),
            Err(RetryPolicyError::BackoffCoefficient(_))
        ));
    }

    #[test]
    fn test_max_interval_below_initial_rejected() {
        let err = validate(&policy(3, 2.0, 500, 100)).unwrap_err();
        assert_eq!(
            err,
            RetryPolicyError::MaxInterval {
                initial: 500,
                max: 100
            }
        );
    }

    // -----------------------------------------------------------------------
    // retry_at
    // -----------------------------------------------------------------------

    #[test]
    fn test_retry_at_offsets_now_by_delay() {
        let p = RetryPolicy::default();
        let now = Utc::now();
        assert_eq!(retry_at(&p, 3, now), now + chrono::Duration::milliseconds(2_000));
        assert_eq!(retry_at(&p, 1, now), now);
    }
}
