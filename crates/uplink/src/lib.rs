//! # Uplink
//!
//! Client-side communication layer for talking to a single backend API over
//! HTTP and WebSocket.
//!
//! ## Features
//!
//! - **Token store**: access and refresh tokens in a durable or session scope
//! - **Authenticated HTTP**: bearer injection, request IDs, logging hooks and a
//!   single-flight token refresh on `401`
//! - **Error classification**: every failure becomes an [`AppError`] with a
//!   stable code and category
//! - **Retry**: exponential backoff for any async operation
//! - **Live streams**: WebSocket connections shared per URL with history
//!   replay and reconnect
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use uplink::{ApiClient, AuthTokenPair, HttpConfig};
//!
//! #[derive(serde::Deserialize)]
//! struct Profile {
//!     name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HttpConfig::builder("https://api.example.com")
//!         .timeout(std::time::Duration::from_secs(30))
//!         .build()?;
//!     let client = ApiClient::new(config)?;
//!
//!     let pair = AuthTokenPair {
//!         access_token: "access".into(),
//!         refresh_token: "refresh".into(),
//!         expires_in: 3600,
//!     };
//!     client.tokens().store_tokens(&pair, true)?;
//!
//!     let profile: Profile = client.get("/users/me").await?;
//!     println!("hello {}", profile.name);
//!     Ok(())
//! }
//! ```

pub mod classify;
pub mod error;
pub mod hooks;
pub mod http;
pub(crate) mod reconnect;
pub mod retry;
pub mod tokens;
pub mod transport;
pub mod websocket;

pub use classify::{classify_http_error, classify_stream_error, is_retryable};
pub use error::{ApiResult, AppError, ErrorCategory, TransportError, TransportResult};
pub use hooks::{
    AfterResponseHook, AuthHeaderHook, BeforeRequestHook, HeaderInjectionHook, HookError, Hooks,
    LoggingHook, OnErrorHook, RequestIdHook,
};
pub use http::{ApiClient, ApiClientBuilder, HttpConfig, ReqwestTransport, SessionHandler};
pub use retry::{RetryConfig, with_retry};
pub use tokens::{AuthTokenPair, TokenRefresher, TokenStore};
pub use transport::{Method, Request, RequestId, Response, Transport};
pub use websocket::{
    ConnectionManager, ConnectionState, ConnectionStatus, ReconnectConfig, ReconnectingSocket,
    Subscription, WsConfig,
};
