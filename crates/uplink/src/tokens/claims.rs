//! Decoding of the claims segment of a bearer token.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Deserialize;

use crate::error::{TransportError, TransportResult};

/// Tokens expiring within this window are treated as already expired.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Claims recovered from a token payload. Recomputed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTokenClaims {
    pub subject: String,
    /// Seconds since the Unix epoch.
    pub issued_at: i64,
    /// Seconds since the Unix epoch; `None` when the token carries no `exp`.
    pub expires_at: Option<i64>,
}

#[derive(Deserialize)]
struct RawClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    exp: Option<i64>,
}

/// Decode the second segment of a `header.payload.signature` token.
pub fn decode_claims(token: &str) -> TransportResult<DecodedTokenClaims> {
    let mut segments = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(TransportError::auth("token must have three segments"));
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| TransportError::auth(format!("invalid token encoding: {e}")))?;
    let raw: RawClaims = serde_json::from_slice(&bytes)?;

    Ok(DecodedTokenClaims {
        subject: raw.sub.unwrap_or_default(),
        issued_at: raw.iat.unwrap_or_default(),
        expires_at: raw.exp,
    })
}

/// Fail-closed expiry check with a [`EXPIRY_MARGIN`] safety window.
pub fn is_expired(token: &str) -> bool {
    is_expired_at(token, SystemTime::now())
}

pub(crate) fn is_expired_at(token: &str, now: SystemTime) -> bool {
    let Ok(claims) = decode_claims(token) else {
        return true;
    };
    let Some(expires_at) = claims.expires_at else {
        return true;
    };

    let now = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    expires_at <= now + EXPIRY_MARGIN.as_secs() as i64
}

impl DecodedTokenClaims {
    /// The expiry as a wall-clock instant.
    pub fn expires_at_time(&self) -> Option<SystemTime> {
        let secs = u64::try_from(self.expires_at?).ok()?;
        UNIX_EPOCH.checked_add(Duration::from_secs(secs))
    }
}
