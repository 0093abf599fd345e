//! Worker errors and retry backoff.
//!
//! A worker reports failure with a [`WorkerError`]. By default the failure is
//! transient and the job is retried after its `retry_delay`; a permanent error
//! (`retry == false`) terminates the job immediately with the original message.
//! Individual errors may override the job's backoff for that one failure.
//!
//! # Backoff
//!
//! With `progressive_delay` off, every retry waits `retry_delay`. With it on,
//! attempt `n` (1-based) waits `retry_delay * n`:
//!
//! ```rust
//! use beehive::retry::retry_delay_ms;
//!
//! // fixed: 3s, 3s
//! assert_eq!(retry_delay_ms(3000, false, 1), 3000);
//! assert_eq!(retry_delay_ms(3000, false, 2), 3000);
//!
//! // progressive: 3s, 6s
//! assert_eq!(retry_delay_ms(3000, true, 1), 3000);
//! assert_eq!(retry_delay_ms(3000, true, 2), 6000);
//! ```

use crate::{BeehiveError, job::JobOptions};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Failure reported by user code.
///
/// # Examples
///
/// ```rust
/// use beehive::WorkerError;
/// use std::time::Duration;
///
/// // transient, retried with the job's backoff
/// let transient = WorkerError::new("upstream unavailable");
/// assert!(transient.retry);
///
/// // permanent, fails the job right away
/// let invalid = WorkerError::permanent("Argument must be positive");
/// assert!(!invalid.retry);
///
/// // transient with its own backoff
/// let slow = WorkerError::new("rate limited").with_retry_delay(Duration::from_secs(5));
/// assert_eq!(slow.retry_delay, Some(Duration::from_secs(5)));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerError {
    pub message: String,
    pub retry: bool,
    pub retry_delay: Option<Duration>,
    pub progressive_delay: Option<bool>,
}

impl WorkerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry: true,
            retry_delay: None,
            progressive_delay: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retry: false,
            ..Self::new(message)
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn with_progressive_delay(mut self, progressive: bool) -> Self {
        self.progressive_delay = Some(progressive);
        self
    }

    /// Resolve the overrides against the job's options for the engine.
    pub(crate) fn into_exception(self, options: &JobOptions) -> Exception {
        Exception {
            message: self.message,
            retry: self.retry,
            retry_delay: self
                .retry_delay
                .map(|d| d.as_millis() as u64)
                .unwrap_or(options.retry_delay),
            progressive_delay: self
                .progressive_delay
                .unwrap_or(options.progressive_delay),
        }
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for WorkerError {}

impl From<String> for WorkerError {
    fn from(message: String) -> Self {
        WorkerError::new(message)
    }
}

impl From<&str> for WorkerError {
    fn from(message: &str) -> Self {
        WorkerError::new(message)
    }
}

/// Errors bubbling out of nested jobs: validation failures are permanent,
/// everything else (a failed or canceled sub-job included) is transient.
impl From<BeehiveError> for WorkerError {
    fn from(err: BeehiveError) -> Self {
        let permanent = matches!(err, BeehiveError::Validation { .. });
        let message = err.to_string();
        if permanent {
            WorkerError::permanent(message)
        } else {
            WorkerError::new(message)
        }
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        WorkerError::permanent(format!("Invalid job arguments: {}", err))
    }
}

/// A failure as handed to the `failed` script, with every override resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exception {
    pub message: String,
    pub retry: bool,
    pub retry_delay: u64,
    pub progressive_delay: bool,
}

/// Backoff before retry `attempt` (1-based), in milliseconds.
pub fn retry_delay_ms(retry_delay: u64, progressive: bool, attempt: u32) -> u64 {
    if progressive {
        retry_delay.saturating_mul(u64::from(attempt.max(1)))
    } else {
        retry_delay
    }
}
