//! Typed errors for the exchange connector.

use thiserror::Error;

/// Errors surfaced by the exchange connector.
///
/// Transport and rate-limit failures are retryable; rejections and auth
/// failures are not and must be handled by the caller.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Network-level failure (connect, send, or read).
    #[error("transport error: {0}")]
    Transport(String),

    /// The exchange told us to slow down (HTTP 429 or code -1003).
    #[error("rate limited (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    /// The exchange refused the request outright.
    #[error("rejected by exchange (code {code}): {reason}")]
    Rejected { code: i64, reason: String },

    /// No acknowledgement arrived within the deadline.
    #[error("request timed out")]
    Timeout,

    /// Invalid or expired credentials.
    #[error("authentication failure: {0}")]
    AuthFailure(String),

    /// Response body did not match the expected shape.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ConnectorError {
    /// Whether a retry of the same request could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::RateLimited { .. } | Self::Timeout
        )
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}
