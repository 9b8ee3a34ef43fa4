//! Live JSON streams over WebSocket.
//!
//! Two entry points share the same error taxonomy:
//!
//! - [`ConnectionManager`]: one physical socket per URL shared by any number
//!   of subscribers, a bounded per-URL message history with optional replay,
//!   and a fixed-delay reconnect after an unclean close.
//! - [`ReconnectingSocket`]: a single consumer, a last-message slot and
//!   exponential backoff with a cap on consecutive attempts.
//!
//! ```text
//! ┌──────────────────┐     ┌────────────┐     ┌─────────────┐
//! │ ConnectionManager│────▶│ Connection │────▶│   Server    │
//! │     (Clone)      │     │ (task/URL) │     │             │
//! └────────┬─────────┘     └─────┬──────┘     └─────────────┘
//!          │                     │ publish
//!          ▼                     ▼
//!   ┌─────────────┐       ┌─────────────┐
//!   │ Hub per URL │◀──────│   History   │
//!   │ subscribers │       │ (100 msgs)  │
//!   └─────────────┘       └─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use uplink::websocket::{ConnectionManager, WsConfig};
//!
//! # async fn demo() -> uplink::TransportResult<()> {
//! let manager = ConnectionManager::new(WsConfig::default())?;
//!
//! let ticker = manager.subscribe(
//!     "wss://stream.example.com/ticker",
//!     |message| println!("tick: {message}"),
//!     true,
//! );
//! let status = manager.subscribe_to_status("wss://stream.example.com/ticker", |status| {
//!     println!("state: {}", status.state);
//! });
//!
//! manager.send("wss://stream.example.com/ticker", &serde_json::json!({"op": "ping"}));
//!
//! ticker.unsubscribe();
//! drop(status);
//! manager.disconnect("wss://stream.example.com/ticker");
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod history;
mod manager;
mod socket;
mod subscription;
mod types;

pub use config::{ReconnectConfig, WsConfig};
pub use connection::Connection;
pub use manager::ConnectionManager;
pub use socket::{CODE_RECONNECT_EXHAUSTED, ReconnectingSocket, SocketState};
pub use subscription::Subscription;
pub use types::{ConnectionState, ConnectionStatus, StreamMessage};
