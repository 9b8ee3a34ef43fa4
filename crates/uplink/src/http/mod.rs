//! Authenticated HTTP request pipeline.

mod client;
mod config;
mod refresh;
mod session;
mod transport;

pub use self::{
    client::{ApiClient, ApiClientBuilder, ClientMetrics},
    config::{
        ENV_API_TIMEOUT_SECS, ENV_API_URL, ENV_LOGIN_PATH, ENV_REFRESH_PATH, HttpConfig,
        HttpConfigBuilder,
    },
    refresh::{CODE_REFRESH_INTERRUPTED, EndpointRefresher},
    session::{LoggingSessionHandler, SessionHandler},
    transport::ReqwestTransport,
};
