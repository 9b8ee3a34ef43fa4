//! Error types for the transport layer.
//!
//! Two layers live here. [`TransportError`] describes what went wrong on the
//! wire and stays inside the crate and its [`Transport`](crate::transport::Transport)
//! implementations. [`AppError`] is the classified, display-safe error that
//! public operations return; see [`crate::classify`] for how one becomes the
//! other.

use std::{fmt, string::FromUtf8Error, time::Duration};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The result type used by transports and internal plumbing.
pub type TransportResult<T> = Result<T, TransportError>;

/// The result type returned by public client operations.
pub type ApiResult<T> = Result<T, AppError>;

/// Raw transport failures.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The request never produced a response (DNS, connect, IO).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Authentication and authorization errors raised locally.
    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The server answered with a non-success status.
    #[error("API error: status={status}, body={body}")]
    Api {
        status: http::StatusCode,
        body: String,
        /// Raw `Retry-After` header value, when the server sent one.
        retry_after: Option<String>,
    },

    /// WebSocket protocol or handshake errors
    #[error("WebSocket error: {message}")]
    WebSocket { message: String },

    /// The peer closed the stream, or it ended without a close frame.
    #[error("Connection closed (code: {code:?})")]
    ConnectionClosed { code: Option<u16> },

    /// Token storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Timeout errors
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl From<FromUtf8Error> for TransportError {
    fn from(e: FromUtf8Error) -> Self {
        Self::Serialization(serde_json::Error::io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            e.to_string(),
        )))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                Self::ConnectionClosed { code: None }
            }
            WsError::Protocol(
                tokio_tungstenite::tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
            ) => Self::ConnectionClosed { code: Some(1006) },
            other => Self::WebSocket {
                message: other.to_string(),
            },
        }
    }
}

impl TransportError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an authentication error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a WebSocket error.
    pub fn websocket(message: impl Into<String>) -> Self {
        Self::WebSocket {
            message: message.into(),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create a connection-closed error.
    pub fn connection_closed(code: Option<u16>) -> Self {
        Self::ConnectionClosed { code }
    }

    /// Create an API error.
    pub fn api(status: http::StatusCode, body: impl Into<String>) -> Self {
        Self::Api {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    /// The HTTP status carried by this error, if the server responded.
    pub fn status(&self) -> Option<http::StatusCode> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Http(e) => e.status(),
            _ => None,
        }
    }
}

/// Closed taxonomy of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Network,
    Api,
    #[serde(rename = "WEBSOCKET")]
    WebSocket,
    Validation,
    Authentication,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "NETWORK",
            Self::Api => "API",
            Self::WebSocket => "WEBSOCKET",
            Self::Validation => "VALIDATION",
            Self::Authentication => "AUTHENTICATION",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// A classified failure, safe to show to a user.
///
/// `message` is human readable; anything technical goes into `details`.
/// Produced once per failure and never mutated afterwards.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
#[serde(rename_all = "camelCase")]
pub struct AppError {
    pub message: String,
    pub code: String,
    pub category: ErrorCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub timestamp: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl AppError {
    /// Create an error stamped with the current time.
    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            category,
            status_code: None,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Shorthand for an authentication failure.
    pub fn authentication(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Authentication, code, message)
    }

    /// Shorthand for a stream failure.
    pub fn websocket(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::WebSocket, code, message)
    }
}

impl From<TransportError> for AppError {
    fn from(error: TransportError) -> Self {
        crate::classify::classify_http_error(&error)
    }
}
