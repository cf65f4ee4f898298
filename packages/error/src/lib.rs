use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    ConcurrencyExceeded,
    NotFound,
    NotRunning,
    SpawnFailed,
    StdinClosed,
    Crashed,
    StoreError,
    PublishTimeout,
    RoutingFailure,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::ConcurrencyExceeded => "concurrency_exceeded",
            Self::NotFound => "not_found",
            Self::NotRunning => "not_running",
            Self::SpawnFailed => "spawn_failed",
            Self::StdinClosed => "stdin_closed",
            Self::Crashed => "crashed",
            Self::StoreError => "store_error",
            Self::PublishTimeout => "publish_timeout",
            Self::RoutingFailure => "routing_failure",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
    #[error("workspace {workspace_id} at session cap ({limit})")]
    ConcurrencyExceeded { workspace_id: String, limit: usize },
    #[error("session not found: {session_id}")]
    NotFound { session_id: String },
    #[error("session not running: {session_id}")]
    NotRunning { session_id: String },
    #[error("failed to spawn session process: {message}")]
    SpawnFailed { message: String },
    #[error("session stdin closed: {session_id}")]
    StdinClosed { session_id: String },
    #[error("session process crashed: {session_id}")]
    Crashed {
        session_id: String,
        exit_code: Option<i32>,
    },
    #[error("store error: {message}")]
    StoreError { message: String },
    #[error("publish timed out after {elapsed_ms}ms")]
    PublishTimeout { elapsed_ms: u64 },
    #[error("routing failed: {message}")]
    RoutingFailure { message: String },
}

impl ConductorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::ConcurrencyExceeded { .. } => ErrorKind::ConcurrencyExceeded,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::NotRunning { .. } => ErrorKind::NotRunning,
            Self::SpawnFailed { .. } => ErrorKind::SpawnFailed,
            Self::StdinClosed { .. } => ErrorKind::StdinClosed,
            Self::Crashed { .. } => ErrorKind::Crashed,
            Self::StoreError { .. } => ErrorKind::StoreError,
            Self::PublishTimeout { .. } => ErrorKind::PublishTimeout,
            Self::RoutingFailure { .. } => ErrorKind::RoutingFailure,
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::StoreError {
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}

/// Unified vendor error taxonomy shared by every provider adapter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Authentication,
    RateLimit,
    InvalidRequest,
    ModelNotFound,
    ContextLength,
    ContentFilter,
    Server,
    Timeout,
    Network,
    Unknown,
}

impl ProviderErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::RateLimit => "rate_limit",
            Self::InvalidRequest => "invalid_request",
            Self::ModelNotFound => "model_not_found",
            Self::ContextLength => "context_length",
            Self::ContentFilter => "content_filter",
            Self::Server => "server",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Unknown => "unknown",
        }
    }

    /// Rate-limit, server, timeout, and network failures are transient and
    /// safe to reissue; everything else propagates immediately.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::Server | Self::Timeout | Self::Network
        )
    }
}

#[derive(Debug, Error)]
#[error("{kind:?} error from {provider}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub provider: &'static str,
    pub message: String,
    /// Vendor-supplied backoff hint (e.g. `retry-after` header).
    pub retry_after: Option<Duration>,
    /// HTTP status when the failure came from a wire response.
    pub status: Option<u16>,
}

impl ProviderError {
    pub fn new(
        kind: ProviderErrorKind,
        provider: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            provider,
            message: message.into(),
            retry_after: None,
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn timeout(provider: &'static str, elapsed: Duration) -> Self {
        Self::new(
            ProviderErrorKind::Timeout,
            provider,
            format!("operation exceeded deadline after {}ms", elapsed.as_millis()),
        )
    }

    pub fn invalid_request(provider: &'static str, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::InvalidRequest, provider, message)
    }

    pub fn network(provider: &'static str, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Network, provider, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ProviderErrorKind::RateLimit.is_retryable());
        assert!(ProviderErrorKind::Server.is_retryable());
        assert!(ProviderErrorKind::Timeout.is_retryable());
        assert!(ProviderErrorKind::Network.is_retryable());
        assert!(!ProviderErrorKind::Authentication.is_retryable());
        assert!(!ProviderErrorKind::ContentFilter.is_retryable());
        assert!(!ProviderErrorKind::ContextLength.is_retryable());
    }

    #[test]
    fn error_kind_round_trip() {
        let err = ConductorError::ConcurrencyExceeded {
            workspace_id: "ws-1".to_string(),
            limit: 10,
        };
        assert_eq!(err.kind(), ErrorKind::ConcurrencyExceeded);
        assert_eq!(err.kind().as_str(), "concurrency_exceeded");
    }
}
