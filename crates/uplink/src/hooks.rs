//! Interception points around every HTTP dispatch.
//!
//! Bearer attachment, correlation IDs and request logging are ordinary
//! hooks registered by [`ApiClientBuilder`](crate::http::ApiClientBuilder);
//! callers append their own after them.
//!
//! ```rust,ignore
//! use uplink::{Request, hooks::{BeforeRequestHook, HookError}};
//!
//! struct Tenant(&'static str);
//!
//! #[async_trait::async_trait]
//! impl BeforeRequestHook for Tenant {
//!     async fn on_request(&self, request: &mut Request) -> Result<(), HookError> {
//!         request.headers.insert("X-Tenant".into(), self.0.into());
//!         Ok(())
//!     }
//! }
//! ```

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::Level;

use crate::{
    error::TransportError,
    tokens::TokenStore,
    transport::{Request, Response},
};

pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// The hook refused to let the request continue.
    #[error("{hook} rejected the request: {reason}")]
    Rejected { hook: &'static str, reason: String },

    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl HookError {
    pub fn rejected(hook: &'static str, reason: impl Into<String>) -> Self {
        Self::Rejected {
            hook,
            reason: reason.into(),
        }
    }

    pub fn other<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Self::Other(Box::new(error))
    }
}

impl From<HookError> for TransportError {
    fn from(error: HookError) -> Self {
        TransportError::internal(error.to_string())
    }
}

/// Runs before every dispatch, replays included, on a fresh copy of the
/// caller's request.
#[async_trait]
pub trait BeforeRequestHook: Send + Sync {
    async fn on_request(&self, request: &mut Request) -> Result<(), HookError>;

    fn name(&self) -> &'static str {
        "before_request"
    }
}

/// Runs once per successful response.
#[async_trait]
pub trait AfterResponseHook: Send + Sync {
    async fn on_response(
        &self,
        request: &Request,
        response: &mut Response,
    ) -> Result<(), HookError>;

    fn name(&self) -> &'static str {
        "after_response"
    }
}

/// Observes failed dispatches. Cannot change the outcome.
#[async_trait]
pub trait OnErrorHook: Send + Sync {
    async fn on_error(&self, request: &Request, error: &TransportError) -> Result<(), HookError>;

    fn name(&self) -> &'static str {
        "on_error"
    }
}

/// Ordered hook lists for the three interception points.
#[derive(Default, Clone)]
pub struct Hooks {
    pub before_request: Vec<Arc<dyn BeforeRequestHook>>,
    pub after_response: Vec<Arc<dyn AfterResponseHook>>,
    pub on_error: Vec<Arc<dyn OnErrorHook>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let before: Vec<_> = self.before_request.iter().map(|hook| hook.name()).collect();
        let after: Vec<_> = self.after_response.iter().map(|hook| hook.name()).collect();
        let failed: Vec<_> = self.on_error.iter().map(|hook| hook.name()).collect();
        f.debug_struct("Hooks")
            .field("before_request", &before)
            .field("after_response", &after)
            .field("on_error", &failed)
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn before_request(mut self, hook: impl BeforeRequestHook + 'static) -> Self {
        self.before_request.push(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn after_response(mut self, hook: impl AfterResponseHook + 'static) -> Self {
        self.after_response.push(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_error(mut self, hook: impl OnErrorHook + 'static) -> Self {
        self.on_error.push(Arc::new(hook));
        self
    }

    /// Append every hook of `other` after the ones already registered.
    #[must_use]
    pub fn extend(mut self, other: Hooks) -> Self {
        self.before_request.extend(other.before_request);
        self.after_response.extend(other.after_response);
        self.on_error.extend(other.on_error);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.before_request.is_empty() && self.after_response.is_empty() && self.on_error.is_empty()
    }

    /// Stops at the first failing hook.
    pub async fn run_before_request(&self, request: &mut Request) -> Result<(), HookError> {
        for hook in &self.before_request {
            hook.on_request(request)
                .await
                .inspect_err(|error| tracing::debug!(hook = hook.name(), %error, "Hook failed"))?;
        }
        Ok(())
    }

    /// Stops at the first failing hook.
    pub async fn run_after_response(
        &self,
        request: &Request,
        response: &mut Response,
    ) -> Result<(), HookError> {
        for hook in &self.after_response {
            hook.on_response(request, response)
                .await
                .inspect_err(|error| tracing::debug!(hook = hook.name(), %error, "Hook failed"))?;
        }
        Ok(())
    }

    /// Runs every hook; their failures are logged and never mask `error`.
    pub async fn run_on_error(&self, request: &Request, error: &TransportError) {
        for hook in &self.on_error {
            if let Err(hook_error) = hook.on_error(request, error).await {
                tracing::warn!(hook = hook.name(), error = %hook_error, "on_error hook failed");
            }
        }
    }
}

// `tracing` macros need the level at compile time.
macro_rules! event_at {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            Level::ERROR => tracing::error!($($arg)+),
            Level::WARN => tracing::warn!($($arg)+),
            Level::INFO => tracing::info!($($arg)+),
            Level::DEBUG => tracing::debug!($($arg)+),
            _ => tracing::trace!($($arg)+),
        }
    };
}

/// Logs requests and responses at a chosen level, failures at `WARN`.
#[derive(Debug, Clone, Copy)]
pub struct LoggingHook {
    level: Level,
}

impl LoggingHook {
    pub fn new(level: Level) -> Self {
        Self { level }
    }
}

impl Default for LoggingHook {
    fn default() -> Self {
        Self::new(Level::DEBUG)
    }
}

#[async_trait]
impl BeforeRequestHook for LoggingHook {
    async fn on_request(&self, request: &mut Request) -> Result<(), HookError> {
        event_at!(
            self.level,
            method = %request.method,
            url = %request.url,
            request_id = %request.id,
            retried = request.retried,
            "Sending request"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}

#[async_trait]
impl AfterResponseHook for LoggingHook {
    async fn on_response(
        &self,
        request: &Request,
        response: &mut Response,
    ) -> Result<(), HookError> {
        event_at!(
            self.level,
            method = %request.method,
            url = %request.url,
            status = response.status,
            duration_ms = response.duration.as_millis() as u64,
            "Received response"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}

#[async_trait]
impl OnErrorHook for LoggingHook {
    async fn on_error(&self, request: &Request, error: &TransportError) -> Result<(), HookError> {
        tracing::warn!(
            method = %request.method,
            url = %request.url,
            status = error.status().map(|status| status.as_u16()),
            %error,
            "Request failed"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}

/// Sets fixed headers, overwriting values of the same name.
#[derive(Debug, Clone, Default)]
pub struct HeaderInjectionHook {
    headers: Vec<(String, String)>,
}

impl HeaderInjectionHook {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[async_trait]
impl BeforeRequestHook for HeaderInjectionHook {
    async fn on_request(&self, request: &mut Request) -> Result<(), HookError> {
        request.headers.extend(self.headers.iter().cloned());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "header_injection"
    }
}

/// Copies [`Request::id`] into [`REQUEST_ID_HEADER`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestIdHook;

impl RequestIdHook {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BeforeRequestHook for RequestIdHook {
    async fn on_request(&self, request: &mut Request) -> Result<(), HookError> {
        let id = request.id.to_string();
        request.headers.insert(REQUEST_ID_HEADER.to_string(), id);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "request_id"
    }
}

/// Attaches `Authorization: Bearer <token>`.
///
/// The token store wins; the token set through [`AuthHeaderHook::set_token`]
/// is used only when the store holds nothing. Requests without any token are
/// sent unauthenticated.
#[derive(Debug, Clone)]
pub struct AuthHeaderHook {
    tokens: TokenStore,
    fallback: Arc<RwLock<Option<String>>>,
}

impl AuthHeaderHook {
    pub fn new(tokens: TokenStore) -> Self {
        Self {
            tokens,
            fallback: Arc::new(RwLock::new(None)),
        }
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.fallback.write() = token;
    }

    /// The token the next request will carry.
    pub fn current_token(&self) -> Option<String> {
        self.tokens
            .access_token()
            .or_else(|| self.fallback.read().clone())
    }
}

#[async_trait]
impl BeforeRequestHook for AuthHeaderHook {
    async fn on_request(&self, request: &mut Request) -> Result<(), HookError> {
        request
            .headers
            .retain(|name, _| !name.eq_ignore_ascii_case("authorization"));
        if let Some(token) = self.current_token() {
            request
                .headers
                .insert("Authorization".to_string(), format!("Bearer {token}"));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "auth_header"
    }
}
