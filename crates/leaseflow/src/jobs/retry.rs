use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use crate::error::{QueueError, Result};

/// Hard ceiling on a single retry delay (30 days).
pub const MAX_RETRY_DELAY_SECS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_seconds: i64,
    pub max_seconds: i64,
    pub jitter_pct: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_seconds: 2,
            max_seconds: 15 * 60,
            jitter_pct: 0.20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

/// Classify a downstream response code. A missing code means the request never
/// got an answer (network, timeout) and is worth retrying.
pub fn classify_http(code: Option<i32>) -> ErrorClass {
    match code {
        None => ErrorClass::Retryable,
        Some(408 | 425 | 429) => ErrorClass::Retryable,
        Some(400..=499) => ErrorClass::NonRetryable,
        Some(_) => ErrorClass::Retryable,
    }
}

impl RetryPolicy {
    /// `retry_count` is bumped at claim time, so a job that just failed its
    /// first attempt reports `retry_count == 1`.
    pub fn is_exhausted(retry_count: i32, max_attempts: i32) -> bool {
        retry_count >= max_attempts
    }

    /// Reject policies that cannot produce a sane delay.
    pub fn validate(&self) -> Result<()> {
        if self.base_seconds < 0 {
            return Err(QueueError::Config(format!(
                "retry base_seconds must be >= 0, got {}",
                self.base_seconds
            )));
        }
        if !(0..=MAX_RETRY_DELAY_SECS).contains(&self.max_seconds) {
            return Err(QueueError::Config(format!(
                "retry max_seconds must be within 0..={MAX_RETRY_DELAY_SECS}, got {}",
                self.max_seconds
            )));
        }
        if !self.jitter_pct.is_finite() || !(0.0..=1.0).contains(&self.jitter_pct) {
            return Err(QueueError::Config(format!(
                "retry jitter_pct must be within 0.0..=1.0, got {}",
                self.jitter_pct
            )));
        }
        Ok(())
    }

    /// Never panics, even for a policy that fails [`RetryPolicy::validate`].
    pub fn delay_seconds(&self, attempt_no: i32, rng: &mut impl Rng) -> i64 {
        let max = self.max_seconds.clamp(0, MAX_RETRY_DELAY_SECS);
        let base = self.base_seconds.max(0);
        let attempt_no = attempt_no.max(1) as u32;

        // exponent = attempt_no - 1
        let exp = attempt_no.saturating_sub(1);

        // 2^exp; past 62 the cap takes over anyway
        let pow2 = 1_i64.checked_shl(exp).filter(|v| *v > 0).unwrap_or(i64::MAX);

        let delay = base.saturating_mul(pow2).min(max);

        // NaN fails every comparison, so test for the positive case
        let jitter_pct = if self.jitter_pct > 0.0 {
            self.jitter_pct.min(1.0)
        } else {
            0.0
        };
        if jitter_pct == 0.0 || delay == 0 {
            return delay;
        }

        // jitter in range [-jitter_pct, +jitter_pct]
        let jitter_range = (delay as f64) * jitter_pct;
        let jitter = rng.gen_range(-jitter_range..=jitter_range);

        let jittered = (delay as f64 + jitter).round() as i64;
        jittered.clamp(0, max)
    }

    pub fn next_retry_at(
        &self,
        attempt_no: i32,
        now: DateTime<Utc>,
        rng: &mut impl Rng,
    ) -> DateTime<Utc> {
        now + Duration::seconds(self.delay_seconds(attempt_no, rng))
    }
}
