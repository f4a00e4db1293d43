//! Error taxonomy shared by the traffic core and the control plane.
//!
//! [`ConfigurationError`] is raised before any traffic is sent when a test
//! configuration is missing a field or has an out-of-range value.
//! [`CoordinationError`] covers everything that can go wrong between two
//! nodes: malformed requests, transport failures, and non-success replies.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::error;

use crate::control::messages::ErrorResponse;

// ---------------------------------------------------------------------------
// ConfigurationError
// ---------------------------------------------------------------------------

/// A test configuration that cannot be run as given.
///
/// Never silently corrected: the caller sees exactly which field was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("target address cannot be empty")]
    EmptyTarget,

    #[error("target address '{0}' could not be resolved")]
    InvalidTarget(String),

    #[error("packet rate must be positive")]
    InvalidRate,

    #[error("packet size must be between 1 and 9000 bytes, got {0}")]
    InvalidPacketSize(u32),

    #[error("number of flows must be positive")]
    InvalidFlowCount,

    #[error("number of workers must be between 1 and 64, got {0}")]
    InvalidWorkerCount(u32),

    #[error("duration must be positive")]
    InvalidDuration,

    #[error("traffic ports list cannot be empty")]
    EmptyPorts,

    #[error("{field} must be a whole number, got {value}")]
    NonIntegral { field: &'static str, value: f64 },

    #[error("{field} is too large, got {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("preset '{0}' not found")]
    UnknownPreset(String),

    #[error("invalid configuration value: {0}")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// CoordinationError
// ---------------------------------------------------------------------------

/// Failure of a control-plane operation, on either side of the wire.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The merged test configuration is out of range.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// The inbound request payload is malformed. Node state is unchanged.
    #[error("validation error: {0}")]
    Validation(String),

    /// The handler understood the request but declined it (e.g. a test is
    /// already running).
    #[error("{0}")]
    Rejected(String),

    /// The request body exceeded the control-plane ceiling.
    #[error("request entity too large")]
    PayloadTooLarge,

    /// No handler is attached to the server yet.
    #[error("coordination handler not available")]
    NotReady,

    /// Connection failure or timeout talking to the peer node.
    #[error("network error: {0}")]
    Network(String),

    /// The peer answered with a non-success status or an unparsable body.
    #[error("peer returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    /// Anything else that breaks the protocol.
    #[error("coordination failed: {0}")]
    Protocol(String),
}

impl CoordinationError {
    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoordinationError::Network(_))
    }

    /// HTTP status used when this error is returned by the local server.
    pub fn status_code(&self) -> StatusCode {
        match self {
            CoordinationError::Configuration(_)
            | CoordinationError::Validation(_)
            | CoordinationError::Rejected(_) => StatusCode::BAD_REQUEST,
            CoordinationError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            CoordinationError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            CoordinationError::Network(_)
            | CoordinationError::Api { .. }
            | CoordinationError::Protocol(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CoordinationError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "control-plane request failed");
        }
        (status, Json(ErrorResponse::new(status, self.to_string()))).into_response()
    }
}
