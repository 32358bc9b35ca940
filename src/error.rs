//! Typed errors surfaced by the API client.
//!
//! Every [`ApiError`] carries its [`ErrorKind`] from the point where it is
//! raised, so downstream classification never has to guess from a message.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Coarse error classification used by the error handler and log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Deadline elapsed before a response arrived.
    Timeout,
    /// Transport failure, no response received.
    Network,
    /// A response was received with a non-2xx status.
    Http,
    /// Input rejected locally before any request was made.
    Validation,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::Http => "http",
            ErrorKind::Validation => "validation",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request timed out after {}ms", after.as_millis())]
    Timeout { after: Duration },
    #[error("network error: {0}")]
    Network(String),
    #[error("upload failed ({status}): {reason}")]
    Upload { status: u16, reason: String },
    #[error("chat request failed with status {status}")]
    Chat { status: u16 },
    #[error("not found: {resource}")]
    NotFound { resource: String },
    #[error("request failed ({status}): {message}")]
    Request { status: u16, message: String },
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("{0}")]
    Validation(String),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Timeout { .. } => ErrorKind::Timeout,
            ApiError::Network(_) => ErrorKind::Network,
            ApiError::Upload { .. }
            | ApiError::Chat { .. }
            | ApiError::NotFound { .. }
            | ApiError::Request { .. } => ErrorKind::Http,
            ApiError::Validation(_) => ErrorKind::Validation,
            ApiError::Decode(_) => ErrorKind::Unknown,
        }
    }

    /// HTTP status of the response, when one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Upload { status, .. }
            | ApiError::Chat { status }
            | ApiError::Request { status, .. } => Some(*status),
            ApiError::NotFound { .. } => Some(404),
            _ => None,
        }
    }

    /// Whether a caller-side retry has a chance of succeeding.
    ///
    /// Timeouts, transport failures, 429 and 5xx are transient; everything
    /// else will fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self.kind() {
            ErrorKind::Timeout | ErrorKind::Network => true,
            ErrorKind::Http => self
                .status()
                .map(|s| s == 429 || s >= 500)
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// Classify any `anyhow` error. Errors that do not wrap an [`ApiError`]
/// are [`ErrorKind::Unknown`].
pub fn classify(error: &anyhow::Error) -> ErrorKind {
    error
        .downcast_ref::<ApiError>()
        .map(ApiError::kind)
        .unwrap_or(ErrorKind::Unknown)
}
