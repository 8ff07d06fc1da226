//! Retry/backoff policy for upload jobs.
//!
//! Delay for the n-th retry (n from 0) is `min(max, base * 2^n)`, jittered
//! uniformly into `[delay / 2, delay]`. A job makes at most `max_retries`
//! attempts in total; the failure that exhausts them is surfaced as fatal.

use std::time::Duration;

use rand::Rng;

use vup_core::config::UploadConfig;

use crate::error::FailureClass;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &UploadConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base: Duration::from_millis(cfg.backoff_base_ms),
            max: Duration::from_millis(cfg.backoff_max_ms),
        }
    }

    /// Upper bound of the delay before retry `n` (0-based).
    pub fn ceiling(&self, n: u32) -> Duration {
        let factor = 2u32.saturating_pow(n.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn delay(&self, n: u32) -> Duration {
        let ceiling = self.ceiling(n);
        let floor = ceiling / 2;
        if ceiling <= floor {
            return ceiling;
        }
        rand::thread_rng().gen_range(floor..=ceiling)
    }

    /// Decide what to do after `failed_attempts` attempts (>= 1) have failed,
    /// the last with `class`.
    pub fn decide(&self, class: FailureClass, failed_attempts: u32) -> RetryDecision {
        if !class.is_retryable() || failed_attempts >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            attempt: failed_attempts + 1,
            delay: self.delay(failed_attempts.saturating_sub(1)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&UploadConfig::default())
    }
}
