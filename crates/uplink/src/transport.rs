//! Request and response values exchanged with the wire, and the
//! [`Transport`] seam the HTTP pipeline sends them through.

use std::{
    collections::HashMap,
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use bytes::Bytes;
use rand::{Rng, distr::Alphanumeric};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::TransportResult;

const ID_SUFFIX_LEN: usize = 9;

/// Correlation identifier attached to every outbound request.
///
/// Formatted as `req_<epochMillis>_<9 lowercase alphanumerics>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since| since.as_millis());
        let suffix: String = rand::rng()
            .sample_iter(Alphanumeric)
            .take(ID_SUFFIX_LEN)
            .map(|byte| char::from(byte.to_ascii_lowercase()))
            .collect();
        Self(format!("req_{millis}_{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verbs the pipeline issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for http::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => Self::GET,
            Method::Post => Self::POST,
            Method::Put => Self::PUT,
            Method::Patch => Self::PATCH,
            Method::Delete => Self::DELETE,
        }
    }
}

/// A request as it travels through the pipeline.
///
/// Hooks mutate a clone per dispatch, so a replay after a token refresh
/// starts again from the caller's original headers.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub method: Method,
    /// Absolute URL, or a path resolved against the client's base URL.
    pub url: String,
    pub headers: HashMap<String, String>,
    pub query: Vec<(String, String)>,
    pub body: Option<Bytes>,
    /// Overrides the client-wide timeout.
    pub timeout: Option<Duration>,
    /// Set once the request has been replayed after a token refresh.
    pub retried: bool,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            id: RequestId::new(),
            method,
            url: url.into(),
            headers: HashMap::new(),
            query: Vec::new(),
            body: None,
            timeout: None,
            retried: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::Put, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::Patch, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Append a query pair. Repeated names are kept in order.
    #[must_use]
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `data` as the body and mark it `application/json`.
    pub fn json<T: Serialize + ?Sized>(self, data: &T) -> TransportResult<Self> {
        let encoded = serde_json::to_vec(data)?;
        Ok(self
            .header("Content-Type", "application/json")
            .body(encoded))
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Header lookup ignoring ASCII case.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        lookup(&self.headers, name)
    }
}

/// A successful response returned by a [`Transport`].
#[derive(Debug, Clone)]
pub struct Response {
    pub request_id: RequestId,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    /// Round-trip time measured by the transport.
    pub duration: Duration,
}

impl Response {
    pub fn new(request_id: RequestId, status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            request_id,
            status,
            headers: HashMap::new(),
            body: body.into(),
            duration: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, 200..=299)
    }

    /// Decode the body. A blank body (204, empty 200) decodes as `null`, so
    /// callers can ask for `()` or `Option<T>`.
    pub fn json<T: DeserializeOwned>(&self) -> TransportResult<T> {
        let blank = self.body.iter().all(u8::is_ascii_whitespace);
        let payload: &[u8] = if blank { b"null" } else { &self.body };
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn text(&self) -> TransportResult<String> {
        Ok(String::from_utf8(self.body.to_vec())?)
    }

    /// Header lookup ignoring ASCII case.
    pub fn header(&self, name: &str) -> Option<&str> {
        lookup(&self.headers, name)
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

fn lookup<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find_map(|(key, value)| key.eq_ignore_ascii_case(name).then_some(value.as_str()))
}

/// The wire underneath the HTTP pipeline.
///
/// Implementations turn non-success statuses into
/// [`TransportError::Api`](crate::error::TransportError::Api) so the pipeline
/// sees every failure through a single channel.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: Request) -> TransportResult<Response>;
}
