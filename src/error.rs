//! Error types for the discovery engine
//!
//! The API error taxonomy matters downstream: retry logic keys off
//! `RateLimited`, timeouts must never be retried, and everything else is
//! terminal for the call that produced it.

use thiserror::Error;

/// Errors surfaced by the remote API call path.
#[derive(Error, Debug)]
pub enum ApiError {
    /// The API reported a primary or secondary (abuse) rate limit.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The request exceeded its deadline. Propagates immediately, never retried.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Any other failed call: auth, not-found, malformed response, 5xx.
    #[error("GitHub API error: {message}")]
    Failed {
        status: Option<u16>,
        message: String,
    },
}

impl ApiError {
    /// Build an error from a failed call's status and sanitized message,
    /// routing rate-limit responses to their own variant.
    ///
    /// Secondary rate limits arrive as 403s whose body text is the only
    /// distinguishing signal, so classification is textual.
    pub fn failed(status: Option<u16>, message: String) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("rate limit") || lower.contains("abuse") {
            ApiError::RateLimited(message)
        } else {
            ApiError::Failed { status, message }
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ApiError::RateLimited(_))
    }
}

/// The artifact is conclusively a bundled HTML report whose test data lives in
/// a `data/` directory we cannot reassemble. Distinct from "no report found".
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Unsupported report format: bundled HTML report")]
pub struct UnsupportedFormat;
