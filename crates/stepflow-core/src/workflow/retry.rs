//! Retry policy for failed step attempts.
//!
//! The manager classifies a `WorkerError` into a retry category and decides,
//! given how many retries a step has already used, whether to retry after an
//! exponential backoff delay or give up. Permanent failures never retry.

use std::sync::Mutex;
use std::time::Duration;

use stepflow_types::config::RetryConfig;
use stepflow_types::worker::WorkerError;

// ---------------------------------------------------------------------------
// Categories and decisions
// ---------------------------------------------------------------------------

/// Retry-relevant classification of a worker failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    TransientNetwork,
    /// Provider asked us to back off, optionally for a specific duration.
    RateLimited { retry_after: Option<Duration> },
    Timeout,
    Permanent,
}

impl ErrorCategory {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorCategory::Permanent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

// ---------------------------------------------------------------------------
// RetryManager
// ---------------------------------------------------------------------------

/// Classifies failures and computes backoff delays.
///
/// Holds a seedable RNG for jitter so tests can get reproducible delays.
#[derive(Debug)]
pub struct RetryManager {
    config: RetryConfig,
    rng: Mutex<fastrand::Rng>,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            rng: Mutex::new(fastrand::Rng::new()),
        }
    }

    /// Same as `new` with a fixed jitter seed.
    pub fn with_seed(config: RetryConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn classify(&self, error: &WorkerError) -> ErrorCategory {
        match error {
            WorkerError::Network { .. } => ErrorCategory::TransientNetwork,
            WorkerError::RateLimited { retry_after_ms } => ErrorCategory::RateLimited {
                retry_after: retry_after_ms.map(Duration::from_millis),
            },
            WorkerError::Timeout { .. } => ErrorCategory::Timeout,
            WorkerError::Failed { .. } | WorkerError::Cancelled { .. } => ErrorCategory::Permanent,
        }
    }

    /// Decide what to do after a failure, given the retries already used.
    ///
    /// `retries_so_far` is 0 after the first failed attempt, so a step gets
    /// at most `max_retries + 1` attempts in total.
    pub fn decide(&self, category: ErrorCategory, retries_so_far: u32) -> RetryDecision {
        if !category.is_retryable() || retries_so_far >= self.config.max_retries {
            return RetryDecision::GiveUp;
        }

        let backoff = self.backoff(retries_so_far);
        let delay = match category {
            ErrorCategory::RateLimited {
                retry_after: Some(hint),
            } => backoff.max(hint),
            _ => backoff,
        };
        RetryDecision::Retry { delay }
    }

    /// Classify and decide in one call.
    pub fn on_failure(&self, error: &WorkerError, retries_so_far: u32) -> RetryDecision {
        self.decide(self.classify(error), retries_so_far)
    }

    /// `min(base * multiplier^n, max)` plus jitter in `[0, jitter_ratio * that]`.
    fn backoff(&self, retries_so_far: u32) -> Duration {
        let base = self.config.base_delay_ms as f64;
        let max = self.config.max_delay_ms as f64;
        let exp = i32::try_from(retries_so_far).unwrap_or(i32::MAX);
        let computed = (base * self.config.multiplier.powi(exp)).min(max);

        let jitter = if self.config.jitter_ratio > 0.0 {
            let unit = self
                .rng
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .f64();
            unit * self.config.jitter_ratio * computed
        } else {
            0.0
        };

        Duration::from_millis((computed + jitter).round() as u64)
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
