//! Single-consumer reconnecting socket.
//!
//! A smaller sibling of the [`ConnectionManager`](super::ConnectionManager):
//! no multiplexing, no history, a single last-message slot. Reconnects use
//! exponential backoff and stop for good after
//! [`ReconnectConfig::max_attempts`] consecutive failures.

use std::{fmt, sync::Arc};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::{
    sync::{Notify, mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

use super::{config::ReconnectConfig, types::StreamMessage};
use crate::{
    classify::classify_stream_error,
    error::{AppError, TransportError, TransportResult},
    reconnect::calculate_backoff,
};

pub const CODE_RECONNECT_EXHAUSTED: &str = "WEBSOCKET_RECONNECT_EXHAUSTED";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Handles of the task currently driving the socket.
struct Run {
    shutdown: Arc<Notify>,
    outbound: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

/// State shared with the driving task.
struct SocketInner {
    url: String,
    config: ReconnectConfig,
    state: watch::Sender<SocketState>,
    last_message: watch::Sender<Option<StreamMessage>>,
    error: Mutex<Option<AppError>>,
}

/// Owned by the handles only, so the last drop stops the task.
struct Shared {
    inner: Arc<SocketInner>,
    run: Mutex<Option<Run>>,
}

/// A reconnecting WebSocket for a single consumer.
#[derive(Clone)]
pub struct ReconnectingSocket {
    shared: Arc<Shared>,
}

impl fmt::Debug for ReconnectingSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectingSocket")
            .field("url", &self.shared.inner.url)
            .field("state", &self.state())
            .field("config", &self.shared.inner.config)
            .finish()
    }
}

enum SessionEnd {
    Clean,
    Unclean { opened: bool, error: AppError },
}

impl ReconnectingSocket {
    pub fn new(url: impl Into<String>, config: ReconnectConfig) -> TransportResult<Self> {
        config.validate()?;
        let (state, _) = watch::channel(SocketState::Idle);
        let (last_message, _) = watch::channel(None);
        Ok(Self {
            shared: Arc::new(Shared {
                inner: Arc::new(SocketInner {
                    url: url.into(),
                    config,
                    state,
                    last_message,
                    error: Mutex::new(None),
                }),
                run: Mutex::new(None),
            }),
        })
    }

    pub fn url(&self) -> &str {
        &self.shared.inner.url
    }

    pub fn state(&self) -> SocketState {
        *self.shared.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SocketState> {
        self.shared.inner.state.subscribe()
    }

    pub fn last_message(&self) -> Option<StreamMessage> {
        self.shared.inner.last_message.borrow().clone()
    }

    pub fn watch_messages(&self) -> watch::Receiver<Option<StreamMessage>> {
        self.shared.inner.last_message.subscribe()
    }

    /// The most recent failure; terminal once reconnects are exhausted.
    pub fn error(&self) -> Option<AppError> {
        self.shared.inner.error.lock().clone()
    }

    /// Start connecting. A no-op while a previous run is still active.
    pub fn connect(&self) {
        let mut run = self.shared.run.lock();
        if run.as_ref().is_some_and(|run| !run.task.is_finished()) {
            return;
        }

        *self.shared.inner.error.lock() = None;
        let shutdown = Arc::new(Notify::new());
        let (outbound, commands) = mpsc::unbounded_channel();
        let task = tokio::spawn(drive(
            Arc::clone(&self.shared.inner),
            Arc::clone(&shutdown),
            commands,
        ));
        *run = Some(Run {
            shutdown,
            outbound,
            task,
        });
    }

    /// Close cleanly and stop reconnecting.
    pub fn disconnect(&self) {
        if let Some(run) = self.shared.run.lock().take() {
            run.shutdown.notify_one();
        }
    }

    /// Queue `data` if the socket is open. Strings go out verbatim.
    pub fn send<T: Serialize + ?Sized>(&self, data: &T) -> bool {
        if self.state() != SocketState::Open {
            tracing::warn!(url = %self.url(), "Dropping send on a socket that is not open");
            return false;
        }
        let text = match serde_json::to_value(data) {
            Ok(Value::String(text)) => text,
            Ok(value) => value.to_string(),
            Err(error) => {
                tracing::warn!(url = %self.url(), %error, "Dropping unserializable payload");
                return false;
            }
        };
        self.shared
            .run
            .lock()
            .as_ref()
            .is_some_and(|run| run.outbound.send(text).is_ok())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(run) = self.run.get_mut().take() {
            run.task.abort();
        }
    }
}

async fn drive(
    inner: Arc<SocketInner>,
    shutdown: Arc<Notify>,
    mut commands: mpsc::UnboundedReceiver<String>,
) {
    let backoff = inner.config.backoff();
    let mut attempt = 0u32;

    loop {
        inner.state.send_replace(SocketState::Connecting);
        let end = session(&inner, &shutdown, &mut commands).await;
        inner.state.send_replace(SocketState::Closed);

        let error = match end {
            SessionEnd::Clean => {
                tracing::info!(url = %inner.url, "Socket closed");
                return;
            }
            SessionEnd::Unclean { opened, error } => {
                if opened {
                    attempt = 0;
                }
                error
            }
        };

        if attempt >= inner.config.max_attempts {
            tracing::error!(
                url = %inner.url,
                attempts = attempt,
                %error,
                "Reconnect attempts exhausted"
            );
            *inner.error.lock() = Some(
                AppError::websocket(
                    CODE_RECONNECT_EXHAUSTED,
                    "Unable to restore the live connection.",
                )
                .with_details(json!({
                    "attempts": attempt,
                    "lastError": error,
                })),
            );
            return;
        }

        let delay = calculate_backoff(backoff, attempt);
        attempt += 1;
        tracing::warn!(
            url = %inner.url,
            attempt,
            delay_ms = delay.as_millis() as u64,
            %error,
            "Scheduling socket reconnect"
        );
        *inner.error.lock() = Some(error);

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = shutdown.notified() => return,
        }
    }
}

async fn session(
    inner: &SocketInner,
    shutdown: &Notify,
    commands: &mut mpsc::UnboundedReceiver<String>,
) -> SessionEnd {
    let timeout = inner.config.connect_timeout;
    let handshake = tokio::time::timeout(timeout, connect_async(&inner.url));
    let stream = tokio::select! {
        result = handshake => match result {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(error)) => {
                let error = TransportError::websocket(format!("connection failed: {error}"));
                return unclean(false, &error);
            }
            Err(_) => return unclean(false, &TransportError::timeout(timeout)),
        },
        () = shutdown.notified() => return SessionEnd::Clean,
    };

    tracing::info!(url = %inner.url, "Socket open");
    inner.state.send_replace(SocketState::Open);

    let (mut write, mut read) = stream.split();
    loop {
        tokio::select! {
            () = shutdown.notified() => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                };
                if let Err(error) = write.send(Message::Close(Some(frame))).await {
                    tracing::debug!(url = %inner.url, %error, "Close frame not delivered");
                }
                return SessionEnd::Clean;
            }

            Some(text) = commands.recv() => {
                if let Err(error) = write.send(Message::Text(text.into())).await {
                    return unclean(true, &TransportError::from(error));
                }
            }

            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => store(inner, text.as_str()),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => store(inner, text),
                    Err(_) => tracing::warn!(url = %inner.url, "Dropping non UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|frame| u16::from(frame.code));
                    if code == Some(1000) {
                        return SessionEnd::Clean;
                    }
                    return unclean(true, &TransportError::connection_closed(code));
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => return unclean(true, &TransportError::from(error)),
                None => return unclean(true, &TransportError::connection_closed(None)),
            },
        }
    }
}

fn unclean(opened: bool, error: &TransportError) -> SessionEnd {
    SessionEnd::Unclean {
        opened,
        error: classify_stream_error(error),
    }
}

fn store(inner: &SocketInner, text: &str) {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => {
            inner.last_message.send_replace(Some(StreamMessage::from(value)));
        }
        Err(error) => tracing::warn!(url = %inner.url, %error, "Dropping unparseable frame"),
    }
}
