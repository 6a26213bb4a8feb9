use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub retry_after_ms: Option<u64>,
}

impl RateLimitInfo {
    pub fn new(retry_after_ms: Option<u64>) -> Self {
        Self { retry_after_ms }
    }
}

impl fmt::Display for RateLimitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.retry_after_ms {
            Some(ms) => write!(f, " (retry after {ms}ms)"),
            None => Ok(()),
        }
    }
}

impl std::error::Error for RateLimitInfo {}

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("rate limited{0}")]
    RateLimited(#[source] RateLimitInfo),
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("server error: {0}")]
    ServerError(String),
    #[error("timeout")]
    Timeout,
    #[error("parse error: {0}")]
    ParseError(String),
    #[error("provider error: {0}")]
    ProviderError(String),
}

impl LLMError {
    /// Errors that will not go away by asking again with the same input.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LLMError::AuthenticationFailed | LLMError::InvalidRequest(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{LLMError, RateLimitInfo};

    #[test]
    fn rate_limit_display_includes_retry_hint() {
        assert_eq!(
            LLMError::RateLimited(RateLimitInfo::new(None)).to_string(),
            "rate limited"
        );
        assert_eq!(
            LLMError::RateLimited(RateLimitInfo::new(Some(1500))).to_string(),
            "rate limited (retry after 1500ms)"
        );
    }

    #[test]
    fn only_auth_and_request_errors_are_fatal() {
        assert!(LLMError::AuthenticationFailed.is_fatal());
        assert!(LLMError::InvalidRequest("bad".into()).is_fatal());
        assert!(!LLMError::Timeout.is_fatal());
        assert!(!LLMError::ServerError("502".into()).is_fatal());
        assert!(!LLMError::RateLimited(RateLimitInfo::new(Some(10))).is_fatal());
    }
}
