//! Bearer/refresh token storage.
//!
//! Tokens live in one of two scopes: a durable one that outlives the process
//! (remember-me logins) and a session one that does not. Writes name their
//! scope explicitly; reads prefer the durable scope.

mod claims;
mod storage;

use std::{fmt, sync::Arc, time::SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use self::{
    claims::{DecodedTokenClaims, EXPIRY_MARGIN, decode_claims},
    storage::{FileStorage, MemoryStorage, TokenStorage},
};
use crate::error::{ApiResult, AppError, TransportResult};

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const EXPIRES_IN_KEY: &str = "token_expires_in";

const KEYS: [&str; 3] = [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, EXPIRES_IN_KEY];

/// Tokens issued by a login or refresh. Always written as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthTokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
}

/// Exchanges a refresh token for a new token pair.
#[async_trait]
pub trait TokenRefresher: Send + Sync + fmt::Debug {
    async fn refresh(&self, refresh_token: &str) -> ApiResult<AuthTokenPair>;
}

/// Which storage scope a token pair was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenScope {
    Durable,
    Session,
}

/// Owner of the token pair and its two storage scopes.
#[derive(Clone)]
pub struct TokenStore {
    durable: Arc<dyn TokenStorage>,
    session: Arc<dyn TokenStorage>,
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenStore")
            .field("durable", &self.durable)
            .field("session", &self.session)
            .finish()
    }
}

impl TokenStore {
    pub fn new(durable: Arc<dyn TokenStorage>, session: Arc<dyn TokenStorage>) -> Self {
        Self { durable, session }
    }

    /// A store whose scopes both live in memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()), Arc::new(MemoryStorage::new()))
    }

    fn scope(&self, scope: TokenScope) -> &dyn TokenStorage {
        match scope {
            TokenScope::Durable => self.durable.as_ref(),
            TokenScope::Session => self.session.as_ref(),
        }
    }

    /// Write a token pair into the chosen scope.
    pub fn store_tokens(&self, pair: &AuthTokenPair, durable: bool) -> TransportResult<()> {
        let scope = if durable {
            TokenScope::Durable
        } else {
            TokenScope::Session
        };
        let storage = self.scope(scope);

        let expires_in = pair.expires_in.to_string();
        storage.set_all(&[
            (ACCESS_TOKEN_KEY, pair.access_token.as_str()),
            (REFRESH_TOKEN_KEY, pair.refresh_token.as_str()),
            (EXPIRES_IN_KEY, expires_in.as_str()),
        ])?;

        tracing::debug!(?scope, "Stored token pair");
        Ok(())
    }

    fn read(&self, key: &str) -> Option<String> {
        self.durable
            .get(key)
            .or_else(|| self.session.get(key))
            .filter(|value| !value.is_empty())
    }

    pub fn access_token(&self) -> Option<String> {
        self.read(ACCESS_TOKEN_KEY)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read(REFRESH_TOKEN_KEY)
    }

    /// Lifetime in seconds recorded with the current pair.
    pub fn expires_in(&self) -> Option<u64> {
        self.read(EXPIRES_IN_KEY)?.parse().ok()
    }

    /// Scope currently holding a refresh token, durable first.
    pub fn active_scope(&self) -> Option<TokenScope> {
        if self.durable.get(REFRESH_TOKEN_KEY).is_some() {
            Some(TokenScope::Durable)
        } else if self.session.get(REFRESH_TOKEN_KEY).is_some() {
            Some(TokenScope::Session)
        } else {
            None
        }
    }

    pub fn has_session(&self) -> bool {
        self.access_token().is_some()
    }

    /// See [`claims::is_expired`](self::claims::is_expired).
    pub fn is_expired(&self, token: &str) -> bool {
        claims::is_expired(token)
    }

    /// Expiry of the stored access token, if it decodes.
    pub fn expires_at(&self) -> Option<SystemTime> {
        decode_claims(&self.access_token()?)
            .ok()?
            .expires_at_time()
    }

    /// Remove every known key from both scopes. Storage failures are logged.
    pub fn clear(&self) {
        for scope in [TokenScope::Durable, TokenScope::Session] {
            let storage = self.scope(scope);
            for key in KEYS {
                if let Err(error) = storage.remove(key) {
                    tracing::warn!(?scope, key, %error, "Failed to remove token");
                }
            }
        }
    }

    /// Exchange the stored refresh token for a new pair and store it in the
    /// scope that held the old one. Returns the new access token.
    pub async fn refresh(&self, refresher: &dyn TokenRefresher) -> ApiResult<String> {
        let scope = self.active_scope().unwrap_or(TokenScope::Session);
        let refresh_token = self.refresh_token().ok_or_else(|| {
            AppError::authentication("NO_REFRESH_TOKEN", "Please log in to continue.")
        })?;

        let pair = refresher.refresh(&refresh_token).await?;
        self.store_tokens(&pair, scope == TokenScope::Durable)?;

        Ok(pair.access_token)
    }
}
