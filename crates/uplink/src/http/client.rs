//! The authenticated request pipeline.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use http::StatusCode;
use serde::{Serialize, de::DeserializeOwned};

use super::{
    config::HttpConfig,
    refresh::{EndpointRefresher, RefreshCoordinator, Ticket, interrupted},
    session::{LoggingSessionHandler, SessionHandler},
    transport::ReqwestTransport,
};
use crate::{
    error::{ApiResult, AppError, TransportError, TransportResult},
    hooks::{AuthHeaderHook, Hooks, LoggingHook, RequestIdHook},
    tokens::{TokenRefresher, TokenStore},
    transport::{Method, Request, Response, Transport},
};

/// Pipeline counters.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    /// Dispatches handed to the transport, replays included.
    pub requests_sent: AtomicU64,
    pub requests_succeeded: AtomicU64,
    pub requests_failed: AtomicU64,
    /// Refreshes started by a leader.
    pub token_refreshes: AtomicU64,
}

impl ClientMetrics {
    /// Share of finished requests that succeeded.
    pub fn success_rate(&self) -> f64 {
        let succeeded = self.requests_succeeded.load(Ordering::Relaxed);
        let failed = self.requests_failed.load(Ordering::Relaxed);
        if succeeded + failed == 0 {
            0.0
        } else {
            succeeded as f64 / (succeeded + failed) as f64
        }
    }
}

struct ClientInner {
    config: HttpConfig,
    transport: Arc<dyn Transport>,
    hooks: Hooks,
    tokens: TokenStore,
    auth: AuthHeaderHook,
    refresher: Arc<dyn TokenRefresher>,
    session: Arc<dyn SessionHandler>,
    refresh: RefreshCoordinator,
    metrics: ClientMetrics,
}

/// HTTP client that authenticates every request and transparently renews
/// an expired session.
///
/// A 401 on a request that has not been replayed yet triggers one token
/// refresh shared by every request failing at the same time; each of them
/// is then replayed once with the new token. Every other failure is
/// classified into an [`AppError`] and returned as is.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("config", &self.inner.config)
            .field("hooks", &self.inner.hooks)
            .field("refresh", &self.inner.refresh)
            .finish()
    }
}

impl ApiClient {
    /// A client with the reqwest transport, in-memory tokens and a logging
    /// session handler.
    pub fn new(config: HttpConfig) -> TransportResult<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: HttpConfig) -> ApiClientBuilder {
        ApiClientBuilder::new(config)
    }

    pub fn config(&self) -> &HttpConfig {
        &self.inner.config
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.inner.tokens
    }

    pub fn metrics(&self) -> &ClientMetrics {
        &self.inner.metrics
    }

    /// Use `token` for requests while the token store holds none.
    pub fn set_auth_token(&self, token: impl Into<String>) {
        self.inner.auth.set_token(Some(token.into()));
    }

    pub fn clear_auth_token(&self) {
        self.inner.auth.set_token(None);
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        self.send(Request::get(path)).await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> ApiResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_json(Method::Post, path, body).await
    }

    pub async fn put<B, T>(&self, path: &str, body: &B) -> ApiResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_json(Method::Put, path, body).await
    }

    pub async fn patch<B, T>(&self, path: &str, body: &B) -> ApiResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_json(Method::Patch, path, body).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        self.send(Request::delete(path)).await
    }

    async fn send_json<B, T>(&self, method: Method, path: &str, body: &B) -> ApiResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = Request::new(method, path).json(body)?;
        self.send(request).await
    }

    /// Send a custom request and decode its JSON body. An empty body decodes
    /// as `null`.
    pub async fn send<T: DeserializeOwned>(&self, request: Request) -> ApiResult<T> {
        let response = self.send_raw(request).await?;
        Ok(response.json()?)
    }

    /// Send a custom request and return the raw response.
    pub async fn send_raw(&self, mut request: Request) -> ApiResult<Response> {
        let inner = &self.inner;
        request.url = inner.config.resolve(&request.url);

        loop {
            let mut outbound = request.clone();
            if let Err(error) = inner.hooks.run_before_request(&mut outbound).await {
                inner.metrics.requests_failed.fetch_add(1, Ordering::Relaxed);
                return Err(TransportError::from(error).into());
            }

            inner.metrics.requests_sent.fetch_add(1, Ordering::Relaxed);
            let error = match inner.transport.send(outbound.clone()).await {
                Ok(mut response) => {
                    let hooked = inner.hooks.run_after_response(&outbound, &mut response).await;
                    if let Err(error) = hooked {
                        inner.metrics.requests_failed.fetch_add(1, Ordering::Relaxed);
                        return Err(TransportError::from(error).into());
                    }
                    inner.metrics.requests_succeeded.fetch_add(1, Ordering::Relaxed);
                    return Ok(response);
                }
                Err(error) => error,
            };

            inner.hooks.run_on_error(&outbound, &error).await;

            if error.status() == Some(StatusCode::UNAUTHORIZED) && !request.retried {
                request.retried = true;
                if let Err(refresh_error) = self.refresh_session().await {
                    inner.metrics.requests_failed.fetch_add(1, Ordering::Relaxed);
                    return Err(refresh_error);
                }
                tracing::debug!(url = %request.url, request_id = %request.id, "Replaying request");
                continue;
            }

            inner.metrics.requests_failed.fetch_add(1, Ordering::Relaxed);
            return Err(AppError::from(error));
        }
    }

    /// Join the current refresh or lead a new one.
    async fn refresh_session(&self) -> ApiResult<String> {
        let inner = &self.inner;

        let guard = match inner.refresh.acquire() {
            Ticket::Follower(rx) => return rx.await.unwrap_or_else(|_| Err(interrupted())),
            Ticket::Leader(guard) => guard,
        };

        inner.metrics.token_refreshes.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Refreshing access token");

        let result = inner.tokens.refresh(inner.refresher.as_ref()).await;
        match &result {
            Ok(_) => tracing::info!("Access token refreshed"),
            Err(error) => {
                tracing::error!(code = %error.code, %error, "Token refresh failed, ending session");
                inner.tokens.clear();
                inner.auth.set_token(None);
                inner.session.logout();
                inner.session.redirect(&inner.config.login_path);
            }
        }

        guard.settle(&result);
        result
    }
}

/// Builder for [`ApiClient`].
pub struct ApiClientBuilder {
    config: HttpConfig,
    transport: Option<Arc<dyn Transport>>,
    tokens: Option<TokenStore>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    session: Option<Arc<dyn SessionHandler>>,
    hooks: Hooks,
}

impl ApiClientBuilder {
    pub fn new(config: HttpConfig) -> Self {
        Self {
            config,
            transport: None,
            tokens: None,
            refresher: None,
            session: None,
            hooks: Hooks::new(),
        }
    }

    /// Replace the reqwest transport.
    #[must_use]
    pub fn transport<T: Transport>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    #[must_use]
    pub fn tokens(mut self, tokens: TokenStore) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Replace the default refresher, which POSTs to `config.refresh_path`.
    #[must_use]
    pub fn refresher<R: TokenRefresher + 'static>(mut self, refresher: R) -> Self {
        self.refresher = Some(Arc::new(refresher));
        self
    }

    #[must_use]
    pub fn session_handler<H: SessionHandler + 'static>(mut self, handler: H) -> Self {
        self.session = Some(Arc::new(handler));
        self
    }

    /// Extra hooks, run after the built-in auth, request ID and logging hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = self.hooks.extend(hooks);
        self
    }

    pub fn build(self) -> TransportResult<ApiClient> {
        self.config.validate()?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(self.config.clone())?),
        };
        let refresher = self.refresher.unwrap_or_else(|| {
            Arc::new(EndpointRefresher::new(
                Arc::clone(&transport),
                self.config.resolve(&self.config.refresh_path),
            ))
        });
        let tokens = self.tokens.unwrap_or_else(TokenStore::in_memory);
        let auth = AuthHeaderHook::new(tokens.clone());

        let hooks = Hooks::new()
            .before_request(auth.clone())
            .before_request(RequestIdHook::new())
            .before_request(LoggingHook::default())
            .after_response(LoggingHook::default())
            .on_error(LoggingHook::default())
            .extend(self.hooks);

        Ok(ApiClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                transport,
                hooks,
                tokens,
                auth,
                refresher,
                session: self
                    .session
                    .unwrap_or_else(|| Arc::new(LoggingSessionHandler)),
                refresh: RefreshCoordinator::default(),
                metrics: ClientMetrics::default(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, time::Duration};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{Value, json};

    use super::*;
    use crate::{
        classify::CODE_UNAUTHORIZED,
        error::ErrorCategory,
        tokens::AuthTokenPair,
    };

    /// Accepts only `Bearer <valid>`; answers 401 otherwise.
    #[derive(Debug)]
    struct TokenGate {
        valid: Mutex<String>,
        calls: AtomicUsize,
        seen: Mutex<Vec<Request>>,
    }

    impl TokenGate {
        fn new(valid: &str) -> Arc<Self> {
            Arc::new(Self {
                valid: Mutex::new(valid.to_string()),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[derive(Debug)]
    struct GateTransport(Arc<TokenGate>);

    #[async_trait]
    impl Transport for GateTransport {
        async fn send(&self, request: Request) -> TransportResult<Response> {
            self.0.calls.fetch_add(1, Ordering::SeqCst);
            self.0.seen.lock().push(request.clone());
            let expected = format!("Bearer {}", self.0.valid.lock());
            if request.header_value("authorization") == Some(expected.as_str()) {
                Ok(Response::new(request.id, 200, r#"{"ok":true}"#))
            } else {
                Err(TransportError::api(StatusCode::UNAUTHORIZED, ""))
            }
        }
    }

    #[derive(Debug)]
    struct SlowRefresher {
        calls: Arc<AtomicUsize>,
        outcome: ApiResult<AuthTokenPair>,
    }

    #[async_trait]
    impl TokenRefresher for SlowRefresher {
        async fn refresh(&self, _refresh_token: &str) -> ApiResult<AuthTokenPair> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.outcome.clone()
        }
    }

    #[derive(Debug, Default)]
    struct RecordingSession {
        logouts: AtomicUsize,
        redirects: Mutex<Vec<String>>,
    }

    impl SessionHandler for Arc<RecordingSession> {
        fn logout(&self) {
            self.logouts.fetch_add(1, Ordering::SeqCst);
        }

        fn redirect(&self, target: &str) {
            self.redirects.lock().push(target.to_string());
        }
    }

    fn pair(access: &str) -> AuthTokenPair {
        AuthTokenPair {
            access_token: access.to_string(),
            refresh_token: format!("{access}-refresh"),
            expires_in: 900,
        }
    }

    fn client(
        gate: &Arc<TokenGate>,
        outcome: ApiResult<AuthTokenPair>,
    ) -> (ApiClient, Arc<AtomicUsize>, Arc<RecordingSession>) {
        let refreshes = Arc::new(AtomicUsize::new(0));
        let session = Arc::new(RecordingSession::default());
        let tokens = TokenStore::in_memory();
        tokens.store_tokens(&pair("stale"), false).unwrap();

        let client = ApiClient::builder(HttpConfig::new("https://api.example.com"))
            .transport(GateTransport(Arc::clone(gate)))
            .tokens(tokens)
            .refresher(SlowRefresher {
                calls: Arc::clone(&refreshes),
                outcome,
            })
            .session_handler(Arc::clone(&session))
            .build()
            .unwrap();
        (client, refreshes, session)
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_refresh() {
        let gate = TokenGate::new("fresh");
        let (client, refreshes, session) = client(&gate, Ok(pair("fresh")));

        let (a, b, c) = tokio::join!(
            client.get::<Value>("/a"),
            client.get::<Value>("/b"),
            client.get::<Value>("/c"),
        );

        assert_eq!(a.unwrap(), json!({"ok": true}));
        assert_eq!(b.unwrap(), json!({"ok": true}));
        assert_eq!(c.unwrap(), json!({"ok": true}));
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(session.logouts.load(Ordering::SeqCst), 0);
        assert_eq!(client.tokens().access_token().as_deref(), Some("fresh"));
        assert_eq!(client.metrics().token_refreshes.load(Ordering::Relaxed), 1);
        assert_eq!(gate.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_failed_refresh_ends_session_once() {
        let gate = TokenGate::new("never");
        let failure = AppError::authentication(CODE_UNAUTHORIZED, "refresh rejected");
        let (client, refreshes, session) = client(&gate, Err(failure));

        let (a, b) = tokio::join!(client.get::<Value>("/a"), client.get::<Value>("/b"));

        for result in [a, b] {
            let err = result.unwrap_err();
            assert_eq!(err.category, ErrorCategory::Authentication);
            assert_eq!(err.message, "refresh rejected");
        }
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(session.logouts.load(Ordering::SeqCst), 1);
        assert_eq!(*session.redirects.lock(), vec!["/login".to_string()]);
        assert!(client.tokens().access_token().is_none());
        assert!(client.tokens().refresh_token().is_none());
    }

    #[tokio::test]
    async fn test_second_401_is_returned_without_another_refresh() {
        // The refresh succeeds but the server still rejects the new token.
        let gate = TokenGate::new("unreachable");
        let (client, refreshes, session) = client(&gate, Ok(pair("fresh")));

        let err = client.get::<Value>("/a").await.unwrap_err();

        assert_eq!(err.code, CODE_UNAUTHORIZED);
        assert_eq!(err.status_code, Some(401));
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(session.logouts.load(Ordering::SeqCst), 0);
        assert_eq!(gate.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_request_headers() {
        let gate = TokenGate::new("stale");
        let (client, refreshes, _) = client(&gate, Ok(pair("fresh")));

        let _: Value = client.post("/items", &json!({"name": "x"})).await.unwrap();

        let seen = gate.seen.lock();
        let request = &seen[0];
        assert_eq!(request.url, "https://api.example.com/items");
        assert_eq!(request.header_value("authorization"), Some("Bearer stale"));
        assert!(
            request
                .header_value("x-request-id")
                .unwrap()
                .starts_with("req_")
        );
        assert_eq!(request.header_value("content-type"), Some("application/json"));
        assert_eq!(refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_manual_token_used_when_store_is_empty() {
        let gate = TokenGate::new("manual");
        let client = ApiClient::builder(HttpConfig::new("https://api.example.com"))
            .transport(GateTransport(Arc::clone(&gate)))
            .build()
            .unwrap();

        assert_eq!(client.metrics().success_rate(), 0.0);

        client.set_auth_token("manual");
        let ok: Value = client.get("/a").await.unwrap();
        assert_eq!(ok, json!({"ok": true}));
        assert_eq!(client.metrics().success_rate(), 1.0);

        client.clear_auth_token();
        let err = client.get::<Value>("/a").await.unwrap_err();
        // No refresh token: the session ends without a refresh call.
        assert_eq!(err.code, "NO_REFRESH_TOKEN");
        assert_eq!(client.metrics().success_rate(), 0.5);
        assert_eq!(client.metrics().requests_sent.load(Ordering::Relaxed), 2);
    }
}
