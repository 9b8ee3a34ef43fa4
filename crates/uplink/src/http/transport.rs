//! [`Transport`] backed by `reqwest`.

use std::{collections::HashMap, time::Instant};

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;

use super::config::HttpConfig;
use crate::{
    error::{TransportError, TransportResult},
    transport::{Request, Response, Transport},
};

/// Production transport. Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    config: HttpConfig,
}

impl ReqwestTransport {
    pub fn new(config: HttpConfig) -> TransportResult<Self> {
        config.validate()?;

        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| TransportError::config(format!("Failed to build client: {e}")))?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: Request) -> TransportResult<Response> {
        let timeout = request.timeout.unwrap_or(self.config.timeout);
        let started = Instant::now();

        let mut builder = self
            .client
            .request(request.method.into(), self.config.resolve(&request.url))
            .timeout(timeout);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        builder = builder.headers(merge_headers(
            &self.config.default_headers,
            &request.headers,
        )?);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| map_reqwest(e, timeout))?;

        let status = response.status();
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value_str) = value.to_str() {
                headers.insert(name.to_string(), value_str.to_string());
            }
        }
        let body = response.bytes().await.map_err(|e| map_reqwest(e, timeout))?;

        if !status.is_success() {
            return Err(TransportError::Api {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
                retry_after: headers.get("retry-after").cloned(),
            });
        }

        Ok(Response {
            request_id: request.id,
            status: status.as_u16(),
            headers,
            body,
            duration: started.elapsed(),
        })
    }
}

/// Client defaults overlaid with the request's own headers. Names compare
/// case-insensitively and the request wins.
fn merge_headers(
    defaults: &HashMap<String, String>,
    overrides: &HashMap<String, String>,
) -> TransportResult<HeaderMap> {
    let mut merged = HeaderMap::with_capacity(defaults.len() + overrides.len());
    for (name, value) in defaults.iter().chain(overrides) {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::config(format!("Invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::config(format!("Invalid value for header {name}: {e}")))?;
        merged.insert(header, value);
    }
    Ok(merged)
}

fn map_reqwest(error: reqwest::Error, timeout: std::time::Duration) -> TransportError {
    if error.is_timeout() {
        TransportError::timeout(timeout)
    } else {
        TransportError::Http(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_config() {
        assert!(ReqwestTransport::new(HttpConfig::new("")).is_err());
        assert!(ReqwestTransport::new(HttpConfig::new("https://api.example.com")).is_ok());
    }

    #[test]
    fn test_request_headers_replace_defaults() {
        let defaults = HashMap::from([
            ("Accept".to_string(), "text/plain".to_string()),
            ("X-Client".to_string(), "uplink".to_string()),
        ]);
        let overrides = HashMap::from([("accept".to_string(), "application/json".to_string())]);

        let merged = merge_headers(&defaults, &overrides).unwrap();

        assert_eq!(merged.get_all("accept").iter().count(), 1);
        assert_eq!(merged["accept"], "application/json");
        assert_eq!(merged["x-client"], "uplink");
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        let overrides = HashMap::from([("Bad Name".to_string(), "v".to_string())]);
        assert!(merge_headers(&HashMap::new(), &overrides).is_err());
    }
}
