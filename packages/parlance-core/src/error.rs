//! Centralized error types for the Parlance core library.
//!
//! Each subsystem defines its own structured error type using `thiserror`;
//! this module rolls them up into the application-wide [`ParlanceError`]
//! and provides machine-readable error codes for logs and API responses.

use thiserror::Error;

use crate::ari::AriError;
use crate::pipeline::AdapterError;
use crate::transport::TransportError;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for logging and API responses.
    fn code(&self) -> &'static str;
}

impl ErrorCode for AriError {
    fn code(&self) -> &'static str {
        match self {
            AriError::Http(_) => "ari_http_request_failed",
            AriError::HttpStatus(_, _) => "ari_http_error_status",
            AriError::NotFound(_) => "ari_resource_not_found",
            AriError::WebSocket(_) => "ari_event_stream_failed",
            AriError::Protocol(_) => "ari_protocol_error",
        }
    }
}

impl ErrorCode for TransportError {
    fn code(&self) -> &'static str {
        match self {
            TransportError::Bind(_) => "transport_bind_failed",
            TransportError::Io(_) => "transport_io_error",
            TransportError::UnknownCall(_) => "transport_unknown_call",
            TransportError::ConnectionClosed(_) => "transport_connection_closed",
            TransportError::InvalidPacket(_) => "transport_invalid_packet",
        }
    }
}

impl ErrorCode for AdapterError {
    fn code(&self) -> &'static str {
        match self {
            AdapterError::Timeout(_) => "adapter_timeout",
            AdapterError::Closed(_) => "adapter_closed",
            AdapterError::Protocol(_) => "adapter_protocol_error",
            AdapterError::Refused(_) => "adapter_refused",
            AdapterError::NotImplemented(_) => "adapter_not_implemented",
            AdapterError::EmptyResponse(_) => "adapter_empty_response",
        }
    }
}

/// Application-wide error type for the Parlance voice agent.
#[derive(Debug, Error)]
pub enum ParlanceError {
    /// Configuration is invalid (bad pipeline key, missing credentials).
    /// Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// ARI control-plane request failed after retries.
    #[error("ARI request failed: {0}")]
    Ari(String),

    /// Media transport failure (socket, binding, framing).
    #[error("Transport error: {0}")]
    Transport(String),

    /// AI component adapter failure.
    #[error("Adapter error: {0}")]
    Adapter(String),

    /// Playback could not be started or completed.
    #[error("Playback error: {0}")]
    Playback(String),

    /// Requested call session does not exist.
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// A call became un-serviceable and was torn down.
    #[error("Call failed: {0}")]
    CallFailed(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ParlanceError {
    /// Returns a machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Ari(_) => "ari_error",
            Self::Transport(_) => "transport_error",
            Self::Adapter(_) => "adapter_error",
            Self::Playback(_) => "playback_error",
            Self::CallNotFound(_) => "call_not_found",
            Self::CallFailed(_) => "call_failed",
            Self::Internal(_) => "internal_error",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Result Type Aliases
// ─────────────────────────────────────────────────────────────────────────────

// Re-export Result type aliases from their defining modules
pub use crate::ari::AriResult;
pub use crate::pipeline::AdapterResult;
pub use crate::transport::TransportResult;

/// Convenient Result alias for application-wide operations.
pub type ParlanceResult<T> = Result<T, ParlanceError>;

impl From<AriError> for ParlanceError {
    fn from(err: AriError) -> Self {
        Self::Ari(err.to_string())
    }
}

impl From<TransportError> for ParlanceError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<AdapterError> for ParlanceError {
    fn from(err: AdapterError) -> Self {
        Self::Adapter(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_returns_correct_code() {
        let err = ParlanceError::Configuration("missing api_key".into());
        assert_eq!(err.code(), "configuration_error");
    }

    #[test]
    fn adapter_error_converts_with_message() {
        let err: ParlanceError = AdapterError::Timeout(30).into();
        assert_eq!(err.code(), "adapter_error");
        assert!(err.to_string().contains("30"));
    }
}
