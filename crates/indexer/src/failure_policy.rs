//! Retry decisions for files whose indexing failed

use codeweave_core::{Error, IndexingConfig};
use std::time::Duration;

/// Whether retrying the same work could succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

impl ErrorClass {
    /// Classify an error raised while indexing a file
    ///
    /// Unrecoverable extraction errors, configuration errors and embedding
    /// errors the provider flagged as non-retryable are permanent. Everything
    /// else (I/O, storage, timeouts) is worth another try.
    pub fn of(error: &Error) -> Self {
        match error {
            Error::Extraction {
                recoverable: false, ..
            }
            | Error::Config(_)
            | Error::InvalidInput(_)
            | Error::Embedding {
                retryable: false, ..
            } => Self::Permanent,
            Error::WithContext { source, .. } => source
                .downcast_ref::<Error>()
                .map_or(Self::Transient, Self::of),
            _ => Self::Transient,
        }
    }
}

/// What to do with a file after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the file straight back on the queue
    RetryImmediately,
    /// Re-enqueue once the delay has passed
    RetryWithBackoff(Duration),
    /// Leave the file `failed` until a forced reindex
    GiveUp,
}

/// Attempt budget and backoff curve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailurePolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl FailurePolicy {
    pub fn from_config(config: &IndexingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
        }
    }

    /// Decide the next step after `attempts` failures in a row
    ///
    /// Permanent errors and exhausted budgets give up. The first transient
    /// failure is retried right away, later ones back off exponentially.
    pub fn decide(&self, attempts: u32, class: ErrorClass) -> RetryDecision {
        if class == ErrorClass::Permanent || attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        if attempts <= 1 {
            return RetryDecision::RetryImmediately;
        }
        RetryDecision::RetryWithBackoff(backoff_delay(self.base_delay, self.max_delay, attempts - 1))
    }
}

/// `base * 2^(n-1)`, capped at `max`; zero for `n == 0`
pub fn backoff_delay(base: Duration, max: Duration, n: u32) -> Duration {
    if n == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(n - 1).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(max, |delay| delay.min(max))
}
