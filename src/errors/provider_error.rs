//! Structured provider failures.
//!
//! Every upstream failure is classified into a fixed [`ErrorKind`] at the
//! boundary that knows the wire format (HTTP status codes, transport errors),
//! so callers can branch on the kind instead of inspecting error messages.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or rejected credentials.
    Authentication,
    /// The upstream throttled the request (HTTP 429).
    RateLimit,
    /// Transport-level failure: connect, DNS, broken stream.
    Network,
    /// The request itself is malformed or unprocessable; retrying cannot help.
    InvalidRequest,
    /// The upstream is temporarily down (HTTP 5xx).
    ServiceUnavailable,
    /// Local misconfiguration: missing provider, invalid settings.
    Configuration,
    /// The request exceeded its deadline.
    Timeout,
    /// Anything that does not fit the categories above.
    Unknown,
}

impl ErrorKind {
    /// Whether a failure of this kind is worth retrying with backoff.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit
                | ErrorKind::Network
                | ErrorKind::ServiceUnavailable
                | ErrorKind::Timeout
        )
    }

    /// Stable string form, matching the serialized representation.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Network => "network",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure from a TTS backend or the selection layer.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{provider}: {kind}: {message}")]
pub struct ProviderError {
    /// Failure classification.
    pub kind: ErrorKind,
    /// Name of the provider that produced the failure.
    pub provider: String,
    /// Correlation id of the operation that failed.
    pub correlation_id: String,
    /// Human-readable detail.
    pub message: String,
    /// Server-suggested wait before retrying, when one was given.
    pub retry_after: Option<Duration>,
    /// HTTP status code, when the failure came from an HTTP response.
    pub status_code: Option<u16>,
}

impl ProviderError {
    pub fn new(
        kind: ErrorKind,
        provider: impl Into<String>,
        correlation_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            provider: provider.into(),
            correlation_id: correlation_id.into(),
            message: message.into(),
            retry_after: None,
            status_code: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Whether the retry machinery may re-attempt this failure.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::RateLimit.is_retryable());
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::ServiceUnavailable.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(!ErrorKind::Authentication.is_retryable());
        assert!(!ErrorKind::InvalidRequest.is_retryable());
        assert!(!ErrorKind::Configuration.is_retryable());
        assert!(!ErrorKind::Unknown.is_retryable());
    }

    #[test]
    fn test_display_includes_provider_and_kind() {
        let err = ProviderError::new(
            ErrorKind::RateLimit,
            "elevenlabs",
            "corr-1",
            "too many requests",
        )
        .with_status(429)
        .with_retry_after(Duration::from_secs(2));

        let rendered = err.to_string();
        assert!(rendered.contains("elevenlabs"));
        assert!(rendered.contains("rate_limit"));
        assert_eq!(err.status_code, Some(429));
        assert_eq!(err.retry_after, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_kind_serialization_is_snake_case() {
        let json = serde_json::to_string(&ErrorKind::InvalidRequest).unwrap();
        assert_eq!(json, "\"invalid_request\"");
        let back: ErrorKind = serde_json::from_str("\"service_unavailable\"").unwrap();
        assert_eq!(back, ErrorKind::ServiceUnavailable);
    }
}
