//! HTTP client configuration.

use std::{collections::HashMap, time::Duration};

use crate::error::{TransportError, TransportResult};

pub const ENV_API_URL: &str = "UPLINK_API_URL";
pub const ENV_API_TIMEOUT_SECS: &str = "UPLINK_API_TIMEOUT_SECS";
pub const ENV_LOGIN_PATH: &str = "UPLINK_LOGIN_PATH";
pub const ENV_REFRESH_PATH: &str = "UPLINK_REFRESH_PATH";

/// Configuration for the HTTP client.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpConfig {
    /// Base URL for all relative request paths
    pub base_url: String,

    /// Default timeout for requests
    pub timeout: Duration,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// User agent string
    pub user_agent: String,

    /// Where the session handler sends the user after a failed refresh
    pub login_path: String,

    /// Endpoint exchanging a refresh token for a new pair
    pub refresh_path: String,

    /// Default headers to include with all requests
    pub default_headers: HashMap<String, String>,
}

impl HttpConfig {
    /// Create a new HTTP configuration with defaults.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: concat!("uplink/", env!("CARGO_PKG_VERSION")).to_string(),
            login_path: "/login".to_string(),
            refresh_path: "/auth/refresh".to_string(),
            default_headers: HashMap::new(),
        }
    }

    /// Create a builder for the HTTP configuration.
    pub fn builder(base_url: impl Into<String>) -> HttpConfigBuilder {
        HttpConfigBuilder::new(base_url)
    }

    /// Build a configuration from `UPLINK_*` environment variables.
    ///
    /// `UPLINK_API_URL` is required; every other variable falls back to its
    /// default.
    pub fn from_env() -> TransportResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> TransportResult<Self> {
        let base_url = lookup(ENV_API_URL)
            .ok_or_else(|| TransportError::config(format!("{ENV_API_URL} is not set")))?;
        let mut builder = Self::builder(base_url);

        if let Some(raw) = lookup(ENV_API_TIMEOUT_SECS) {
            let secs: u64 = raw.trim().parse().map_err(|e| {
                TransportError::config(format!("invalid {ENV_API_TIMEOUT_SECS} {raw:?}: {e}"))
            })?;
            builder = builder.timeout(Duration::from_secs(secs));
        }
        if let Some(path) = lookup(ENV_LOGIN_PATH) {
            builder = builder.login_path(path);
        }
        if let Some(path) = lookup(ENV_REFRESH_PATH) {
            builder = builder.refresh_path(path);
        }

        builder.build()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> TransportResult<()> {
        if self.base_url.is_empty() {
            return Err(TransportError::config("Base URL cannot be empty"));
        }

        if self.timeout.is_zero() {
            return Err(TransportError::config("Timeout cannot be zero"));
        }

        url::Url::parse(&self.base_url)
            .map_err(|e| TransportError::config(format!("Invalid base URL: {e}")))?;

        Ok(())
    }

    /// Resolve a request path against the base URL. Absolute URLs pass through.
    pub fn resolve(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!(
                "{}/{}",
                self.base_url.trim_end_matches('/'),
                path.trim_start_matches('/')
            )
        }
    }
}

/// Builder for HTTP configuration.
#[derive(Debug)]
pub struct HttpConfigBuilder {
    config: HttpConfig,
}

impl HttpConfigBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            config: HttpConfig::new(base_url),
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the user agent.
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    #[must_use]
    pub fn login_path(mut self, path: impl Into<String>) -> Self {
        self.config.login_path = path.into();
        self
    }

    #[must_use]
    pub fn refresh_path(mut self, path: impl Into<String>) -> Self {
        self.config.refresh_path = path.into();
        self
    }

    /// Add a default header.
    #[must_use]
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config
            .default_headers
            .insert(name.into(), value.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> TransportResult<HttpConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
