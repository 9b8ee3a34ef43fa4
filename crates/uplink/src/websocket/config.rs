//! WebSocket connection configuration.

use std::time::Duration;

use crate::{
    error::{TransportError, TransportResult},
    reconnect::BackoffConfig,
};

/// Configuration shared by every connection a
/// [`ConnectionManager`](super::ConnectionManager) opens.
#[derive(Clone, Debug, PartialEq)]
pub struct WsConfig {
    /// Timeout for the opening handshake.
    pub connect_timeout: Duration,
    /// Fixed delay before reconnecting after an unclean close.
    pub reconnect_delay: Duration,
    /// Messages kept per URL for replay.
    pub history_capacity: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(3),
            history_capacity: 100,
        }
    }
}

impl WsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the delay before reconnecting after an unclean close.
    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set how many messages are kept for replay.
    #[must_use]
    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> TransportResult<()> {
        if self.connect_timeout.is_zero() {
            return Err(TransportError::config("Connect timeout cannot be zero"));
        }
        Ok(())
    }
}

/// Backoff policy for a [`ReconnectingSocket`](super::ReconnectingSocket).
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub max_delay: Duration,
    /// Reconnection attempts allowed before the socket gives up.
    pub max_attempts: u32,
    /// Timeout for each opening handshake.
    pub connect_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ReconnectConfig {
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.connect_timeout.is_zero() {
            return Err(TransportError::config("Connect timeout cannot be zero"));
        }
        self.backoff().validate().map_err(TransportError::config)
    }

    pub(crate) fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            factor: 2.0,
        }
    }
}
