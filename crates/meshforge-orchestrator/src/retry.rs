//! Retry classification and backoff.

use meshforge_abstraction::BackendError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry class of a backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Credentials rejected or missing. Never retried.
    Auth,
    /// Provider throttled the request.
    RateLimited,
    /// Provider-side timeout.
    Timeout,
    /// Provider-side failure.
    ServerError,
    /// Anything a retry cannot fix.
    Permanent,
}

impl ErrorClass {
    /// Whether failures of this class are retried.
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::RateLimited | Self::Timeout | Self::ServerError)
    }
}

/// Retry policy for backend submissions.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum attempts for transient failures, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier (e.g., 2.0 for exponential backoff).
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            multiplier,
        }
    }

    /// Maps a backend error onto its retry class.
    pub fn classify(error: &BackendError) -> ErrorClass {
        match error {
            BackendError::Auth(_) => ErrorClass::Auth,
            BackendError::RateLimited(_) => ErrorClass::RateLimited,
            BackendError::Timeout(_) => ErrorClass::Timeout,
            BackendError::Server(_) => ErrorClass::ServerError,
            BackendError::Validation(_)
            | BackendError::UnsupportedModel { .. }
            | BackendError::MalformedResponse { .. }
            | BackendError::Upload(_)
            | BackendError::Permanent(_) => ErrorClass::Permanent,
        }
    }

    /// Whether another attempt follows a failure of `class` on attempt number `attempt` (1-based).
    pub fn should_retry(&self, class: ErrorClass, attempt: u32) -> bool {
        class.is_transient() && attempt < self.max_attempts
    }

    /// Calculate the delay for a given retry.
    ///
    /// Uses exponential backoff: initial_delay * multiplier^retry_count, capped at max_delay.
    pub fn calculate_delay(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let delay_ms = (self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent))
            .min(self.max_delay.as_millis() as f64) as u64;
        Duration::from_millis(delay_ms)
    }
}
