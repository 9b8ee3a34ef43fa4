//! Core type definitions for stream connections.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;

/// Lifecycle state of a managed connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Open and delivering frames.
    Connected,
    /// Closed, cleanly or not.
    Disconnected,
}

impl ConnectionState {
    /// Whether the manager may hand this connection to a new subscriber.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Snapshot delivered to status subscribers on every transition.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Set when the transition was caused by a failure.
    pub last_error: Option<AppError>,
}

impl ConnectionStatus {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            state,
            last_error: None,
        }
    }

    pub fn failed(error: AppError) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_error: Some(error),
        }
    }
}

/// An inbound JSON frame, as delivered to subscribers and stored in history.
///
/// Objects carrying a string `type` field are events; every other value is
/// passed through untouched. Either way the full frame stays available via
/// [`StreamMessage::value`].
#[derive(Clone, Debug, PartialEq)]
pub enum StreamMessage {
    Event { kind: String, data: Value },
    Unknown(Value),
}

impl StreamMessage {
    pub fn kind(&self) -> Option<&str> {
        match self {
            Self::Event { kind, .. } => Some(kind),
            Self::Unknown(_) => None,
        }
    }

    /// The frame as received.
    pub fn value(&self) -> &Value {
        match self {
            Self::Event { data, .. } => data,
            Self::Unknown(value) => value,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Self::Event { data, .. } => data,
            Self::Unknown(value) => value,
        }
    }
}

impl fmt::Display for StreamMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.value(), f)
    }
}

impl Serialize for StreamMessage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value().serialize(serializer)
    }
}

impl From<Value> for StreamMessage {
    fn from(value: Value) -> Self {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string);
        match kind {
            Some(kind) => Self::Event { kind, data: value },
            None => Self::Unknown(value),
        }
    }
}
