//! Single-flight token refresh.
//!
//! The first request to hit a 401 becomes the leader and performs the
//! refresh. Every request that fails while the refresh is in flight parks as
//! a follower and is settled with the leader's outcome.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::oneshot;

use crate::{
    error::{ApiResult, AppError},
    tokens::{AuthTokenPair, TokenRefresher},
    transport::{Request, Transport},
};

pub const CODE_REFRESH_INTERRUPTED: &str = "REFRESH_INTERRUPTED";

type Waiter = oneshot::Sender<ApiResult<String>>;

#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    waiters: Vec<Waiter>,
}

/// Tracks whether a refresh is running and who is waiting on it.
#[derive(Default)]
pub(crate) struct RefreshCoordinator {
    state: Mutex<RefreshState>,
}

impl fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RefreshCoordinator")
            .field("in_flight", &state.in_flight)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// The role a failed request plays in the current refresh cycle.
pub(crate) enum Ticket<'a> {
    Leader(LeaderGuard<'a>),
    Follower(oneshot::Receiver<ApiResult<String>>),
}

impl RefreshCoordinator {
    pub(crate) fn acquire(&self) -> Ticket<'_> {
        let mut state = self.state.lock();
        if state.in_flight {
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            tracing::debug!(waiters = state.waiters.len(), "Queued behind token refresh");
            Ticket::Follower(rx)
        } else {
            state.in_flight = true;
            Ticket::Leader(LeaderGuard {
                coordinator: self,
                settled: false,
            })
        }
    }

    #[cfg(test)]
    fn is_in_flight(&self) -> bool {
        self.state.lock().in_flight
    }

    fn finish(&self, result: &ApiResult<String>) {
        let waiters = {
            let mut state = self.state.lock();
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

/// Held by the leader for the duration of a refresh.
///
/// Dropping it without calling [`LeaderGuard::settle`] clears the in-flight
/// flag and fails every follower with `REFRESH_INTERRUPTED`.
pub(crate) struct LeaderGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl LeaderGuard<'_> {
    pub(crate) fn settle(mut self, result: &ApiResult<String>) {
        self.settled = true;
        self.coordinator.finish(result);
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!("Token refresh abandoned before completion");
            self.coordinator.finish(&Err(interrupted()));
        }
    }
}

pub(crate) fn interrupted() -> AppError {
    AppError::authentication(
        CODE_REFRESH_INTERRUPTED,
        "Your session could not be renewed. Please try again.",
    )
}

/// Refreshes tokens by POSTing `{"refreshToken": …}` to a fixed endpoint.
///
/// Goes straight to the transport, bypassing the pipeline's hooks, so a 401
/// from the refresh endpoint never recurses into another refresh.
pub struct EndpointRefresher {
    transport: Arc<dyn Transport>,
    url: String,
}

impl fmt::Debug for EndpointRefresher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointRefresher")
            .field("url", &self.url)
            .finish()
    }
}

impl EndpointRefresher {
    pub fn new(transport: Arc<dyn Transport>, url: impl Into<String>) -> Self {
        Self {
            transport,
            url: url.into(),
        }
    }
}

#[async_trait]
impl TokenRefresher for EndpointRefresher {
    async fn refresh(&self, refresh_token: &str) -> ApiResult<AuthTokenPair> {
        let request = Request::post(&self.url).json(&json!({ "refreshToken": refresh_token }))?;
        let response = self.transport.send(request).await?;
        Ok(response.json()?)
    }
}
