//! Unified error taxonomy for the message router workspace.
//!
//! Every public operation across C1–C9 returns `Result<T>`. Exceptions never
//! cross a component boundary (spec §7): expected branches like a lock
//! timeout or a not-found lookup are ordinary `Err` variants, not panics.

use thiserror::Error;

/// Result type alias using the workspace error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type, one variant per error kind named in spec §7.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication error (webhook signature, inbound auth boundary only)
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Authorization error
    #[error("Authorization error: {0}")]
    Forbidden(String),

    /// Malformed inbound event: empty contact, unknown channel. Rejected
    /// synchronously with no side effects.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Resource not found (chat/customer/agent/integration absent).
    #[error("Not found: {0}")]
    NotFound(String),

    /// The matched integration exists but is disabled or not connected.
    #[error("Integration disabled: {0}")]
    IntegrationDisabled(String),

    /// The per-contact (C6) or per-chat (C8) lock could not be acquired
    /// within `max_wait`. No side effects; the caller may retry.
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// LLM proxy timeout / 5xx / connection error. Degrades to a canned
    /// apology; never retried by the pipeline itself.
    #[error("Transient upstream error: {0}")]
    TransientUpstream(String),

    /// Channel dispatcher non-2xx. The reply is still persisted; delivery
    /// failure is surfaced in the result and in message metadata.
    #[error("Permanent upstream error: {0}")]
    PermanentUpstream(String),

    /// Invalid input or request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Quota exceeded
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// External service error
    #[error("External service error: {0}")]
    External(String),

    /// Everything else. Treated like `TransientUpstream` plus an audit log
    /// entry by callers.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Channel send error
    #[error("Channel send error")]
    ChannelSend,

    /// Channel receive error
    #[error("Channel receive error")]
    ChannelRecv,

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Other error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create an error with additional context.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Check if this is an authentication error.
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Check if this is a rate limit error.
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    /// Check if this is a quota error.
    pub const fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded(_))
    }

    /// Whether this error is expected enough that the caller should not
    /// also emit an audit log entry (spec §7 propagation policy).
    pub const fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::NotFound(_)
                | Self::IntegrationDisabled(_)
                | Self::LockTimeout(_)
        )
    }

    /// Get HTTP status code for this error.
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Auth(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::Validation(_) | Self::InvalidInput(_) => 400,
            Self::IntegrationDisabled(_) => 409,
            Self::LockTimeout(_) => 423,
            Self::RateLimited(_) | Self::QuotaExceeded(_) => 429,
            Self::Timeout => 408,
            Self::TransientUpstream(_) => 502,
            Self::PermanentUpstream(_) => 502,
            Self::WithContext { source, .. } => source.status_code(),
            _ => 500,
        }
    }
}

/// Extension trait for adding context to any error type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(Error::Auth("test".into()).status_code(), 401);
        assert_eq!(Error::Forbidden("test".into()).status_code(), 403);
        assert_eq!(Error::NotFound("test".into()).status_code(), 404);
        assert_eq!(Error::InvalidInput("test".into()).status_code(), 400);
        assert_eq!(Error::RateLimited("test".into()).status_code(), 429);
        assert_eq!(Error::Internal("test".into()).status_code(), 500);
    }

    #[test]
    fn test_error_with_context() {
        let err = Error::Internal("db failed".into());
        let with_ctx = err.with_context("loading user");
        assert!(matches!(with_ctx, Error::WithContext { .. }));
        assert_eq!(with_ctx.status_code(), 500);
    }
}
