use crate::host::NativeRetryPolicy;
use std::time::Duration;

const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) trait RetryPolicyExt {
    /// Ask this retry policy if a retry should be performed. Caller provides the current attempt
    /// number - the first attempt should start at 1.
    ///
    /// Returns `None` if it should not, otherwise a duration indicating how long to wait before
    /// performing the retry.
    fn should_retry(&self, attempt_number: usize, err_str: &str) -> Option<Duration>;
}

impl RetryPolicyExt for NativeRetryPolicy {
    fn should_retry(&self, attempt_number: usize, err_str: &str) -> Option<Duration> {
        // Zero attempts means unlimited
        if self.maximum_attempts > 0 && attempt_number >= self.maximum_attempts as usize {
            return None;
        }

        for pat in &self.non_retryable_error_types {
            if err_str.contains(pat.as_str()) {
                return None;
            }
        }

        let interval = if self.initial_interval.is_zero() {
            DEFAULT_INITIAL_INTERVAL
        } else {
            self.initial_interval
        };
        if attempt_number == 1 {
            return Some(interval);
        }
        let coeff = if self.backoff_coefficient != 0. {
            self.backoff_coefficient
        } else {
            2.0
        };
        let max_iv = if self.maximum_interval.is_zero() {
            interval.saturating_mul(100)
        } else {
            self.maximum_interval
        };
        let backoff = interval.as_secs_f64() * coeff.powi(attempt_number as i32 - 1);
        // Overflowing backoffs saturate at the maximum interval
        Some(
            Duration::try_from_secs_f64(backoff)
                .map(|b| b.min(max_iv))
                .unwrap_or(max_iv),
        )
    }
}
