//! One physical socket per URL, driven by a background task.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

use super::{
    config::WsConfig,
    subscription::Hub,
    types::{ConnectionState, ConnectionStatus, StreamMessage},
};
use crate::{
    classify::classify_stream_error,
    error::{AppError, TransportError},
};

/// How the socket task ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CloseOutcome {
    /// Close code 1000 or an explicit disconnect.
    Clean,
    Unclean(AppError),
}

pub(crate) type CloseHandler = Box<dyn FnOnce(&Arc<Connection>, &CloseOutcome) + Send>;

/// A shared stream connection.
///
/// Returned by [`ConnectionManager::connect`](super::ConnectionManager::connect);
/// every subscriber of the same URL holds the same instance.
pub struct Connection {
    url: String,
    hub: Arc<Hub>,
    status: Mutex<ConnectionStatus>,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: Notify,
    closing: AtomicBool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url)
            .field("status", &*self.status.lock())
            .field("hub", &self.hub)
            .finish()
    }
}

impl Connection {
    /// Create the connection and spawn its socket task.
    pub(crate) fn open(
        url: &str,
        hub: Arc<Hub>,
        config: &WsConfig,
        on_closed: CloseHandler,
    ) -> Arc<Self> {
        let (outbound, commands) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            url: url.to_string(),
            hub,
            status: Mutex::new(ConnectionStatus::new(ConnectionState::Connecting)),
            outbound,
            shutdown: Notify::new(),
            closing: AtomicBool::new(false),
        });

        tokio::spawn(run(
            Arc::clone(&connection),
            commands,
            config.clone(),
            on_closed,
        ));
        connection
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.status.lock().state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.lock().clone()
    }

    pub fn last_error(&self) -> Option<AppError> {
        self.status.lock().last_error.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    /// Messages currently buffered for replay.
    pub fn history_len(&self) -> usize {
        self.hub.history_len()
    }

    pub(crate) fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Queue `data` for transmission. Strings go out verbatim, anything else
    /// as JSON text. Dropped with a warning unless connected.
    pub fn send<T: Serialize + ?Sized>(&self, data: &T) {
        let state = self.state();
        if state != ConnectionState::Connected {
            tracing::warn!(url = %self.url, %state, "Dropping send on a closed connection");
            return;
        }

        let text = match serde_json::to_value(data) {
            Ok(Value::String(text)) => text,
            Ok(value) => value.to_string(),
            Err(error) => {
                tracing::warn!(url = %self.url, %error, "Dropping unserializable payload");
                return;
            }
        };

        if self.outbound.send(text).is_err() {
            tracing::warn!(url = %self.url, "Dropping send, socket task has ended");
        }
    }

    /// Ask the socket task to close cleanly.
    pub(crate) fn close(&self) {
        self.closing.store(true, Ordering::Release);
        self.shutdown.notify_one();
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock() = status.clone();
        self.hub.notify_status(&status);
    }
}

async fn run(
    connection: Arc<Connection>,
    mut commands: mpsc::UnboundedReceiver<String>,
    config: WsConfig,
    on_closed: CloseHandler,
) {
    connection.set_status(ConnectionStatus::new(ConnectionState::Connecting));

    let outcome = drive(&connection, &mut commands, &config).await;
    match &outcome {
        CloseOutcome::Clean => {
            tracing::info!(url = %connection.url, "Stream closed");
            connection.set_status(ConnectionStatus::new(ConnectionState::Disconnected));
        }
        CloseOutcome::Unclean(error) => {
            tracing::warn!(url = %connection.url, code = %error.code, %error, "Stream lost");
            connection.set_status(ConnectionStatus::failed(error.clone()));
        }
    }

    on_closed(&connection, &outcome);
}

async fn drive(
    connection: &Connection,
    commands: &mut mpsc::UnboundedReceiver<String>,
    config: &WsConfig,
) -> CloseOutcome {
    tracing::info!(url = %connection.url, "Connecting stream");

    let handshake = tokio::time::timeout(config.connect_timeout, connect_async(&connection.url));
    let stream = tokio::select! {
        result = handshake => match result {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(error)) => {
                return unclean(TransportError::websocket(format!("connection failed: {error}")));
            }
            Err(_) => return unclean(TransportError::timeout(config.connect_timeout)),
        },
        () = connection.shutdown.notified() => return CloseOutcome::Clean,
    };

    tracing::info!(url = %connection.url, "Stream connected");
    connection.set_status(ConnectionStatus::new(ConnectionState::Connected));

    let (mut write, mut read) = stream.split();
    loop {
        tokio::select! {
            () = connection.shutdown.notified() => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                };
                if let Err(error) = write.send(Message::Close(Some(frame))).await {
                    tracing::debug!(url = %connection.url, %error, "Close frame not delivered");
                }
                return CloseOutcome::Clean;
            }

            Some(text) = commands.recv() => {
                tracing::debug!(url = %connection.url, bytes = text.len(), "Sending frame");
                if let Err(error) = write.send(Message::Text(text.into())).await {
                    return unclean(TransportError::from(error));
                }
            }

            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => dispatch(connection, text.as_str()),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => dispatch(connection, text),
                    Err(_) => {
                        tracing::warn!(url = %connection.url, "Dropping non UTF-8 binary frame");
                    }
                },
                // tungstenite queues the pong reply itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|frame| u16::from(frame.code));
                    if code == Some(1000) {
                        return CloseOutcome::Clean;
                    }
                    return unclean(TransportError::connection_closed(code));
                }
                Some(Err(error)) => return unclean(TransportError::from(error)),
                None => return unclean(TransportError::connection_closed(None)),
            },
        }
    }
}

fn dispatch(connection: &Connection, text: &str) {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => connection.hub.publish(StreamMessage::from(value)),
        Err(error) => {
            tracing::warn!(url = %connection.url, %error, "Dropping unparseable frame");
        }
    }
}

fn unclean(error: TransportError) -> CloseOutcome {
    CloseOutcome::Unclean(classify_stream_error(&error))
}
