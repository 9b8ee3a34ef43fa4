//! Registry of shared stream connections keyed by URL.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use super::{
    config::WsConfig,
    connection::{CloseOutcome, Connection},
    subscription::{Hub, Subscription},
    types::{ConnectionStatus, StreamMessage},
};
use crate::error::TransportResult;

#[derive(Default)]
struct Registry {
    connections: HashMap<String, Arc<Connection>>,
    /// Outlive individual connections so a reconnect keeps subscribers and
    /// history.
    hubs: HashMap<String, Arc<Hub>>,
    reconnects: HashMap<String, JoinHandle<()>>,
}

struct ManagerInner {
    config: WsConfig,
    registry: Mutex<Registry>,
}

/// Multiplexes any number of subscribers onto one socket per URL.
///
/// Construct one per application and share it by cloning; every clone
/// addresses the same registry. An unclean close schedules a reconnect after
/// [`WsConfig::reconnect_delay`]; a clean one (close code 1000 or
/// [`disconnect`](Self::disconnect)) forgets the URL entirely.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.registry.lock();
        f.debug_struct("ConnectionManager")
            .field("config", &self.inner.config)
            .field("connections", &registry.connections.keys().collect::<Vec<_>>())
            .field("pending_reconnects", &registry.reconnects.len())
            .finish()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::from_valid(WsConfig::default())
    }
}

impl ConnectionManager {
    pub fn new(config: WsConfig) -> TransportResult<Self> {
        config.validate()?;
        Ok(Self::from_valid(config))
    }

    fn from_valid(config: WsConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    pub fn config(&self) -> &WsConfig {
        &self.inner.config
    }

    /// Return the live connection for `url`, opening one if there is none.
    pub fn connect(&self, url: &str) -> Arc<Connection> {
        self.inner.connect(url, false)
    }

    /// Register `on_message` for every JSON frame arriving on `url`.
    ///
    /// With `replay_on_mount`, the messages already buffered for `url` are
    /// delivered first, on a spawned task, before any live message.
    pub fn subscribe<F>(&self, url: &str, on_message: F, replay_on_mount: bool) -> Subscription
    where
        F: Fn(&StreamMessage) + Send + Sync + 'static,
    {
        let connection = self.connect(url);
        connection
            .hub()
            .subscribe(Arc::new(on_message), replay_on_mount)
    }

    /// Register `on_status` for every state transition on `url`.
    pub fn subscribe_to_status<F>(&self, url: &str, on_status: F) -> Subscription
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        let connection = self.connect(url);
        connection.hub().subscribe_status(Arc::new(on_status))
    }

    /// Send `data` on `url`. A no-op with a warning unless connected.
    pub fn send<T: Serialize + ?Sized>(&self, url: &str, data: &T) {
        let connection = self.inner.registry.lock().connections.get(url).cloned();
        match connection {
            Some(connection) => connection.send(data),
            None => tracing::warn!(url, "Dropping send to a URL with no connection"),
        }
    }

    /// Close `url` for every subscriber and cancel any pending reconnect.
    pub fn disconnect(&self, url: &str) {
        let (connection, reconnect) = {
            let mut registry = self.inner.registry.lock();
            registry.hubs.remove(url);
            (
                registry.connections.remove(url),
                registry.reconnects.remove(url),
            )
        };

        if let Some(handle) = reconnect {
            handle.abort();
        }
        if let Some(connection) = connection {
            tracing::info!(url, "Disconnecting stream");
            connection.close();
        }
    }

    /// Disconnect every URL.
    pub fn reset(&self) {
        let urls: Vec<String> = {
            let registry = self.inner.registry.lock();
            registry
                .connections
                .keys()
                .chain(registry.reconnects.keys())
                .cloned()
                .collect()
        };
        for url in urls {
            self.disconnect(&url);
        }
    }

    /// Status of the registered connection for `url`, if any.
    pub fn status(&self, url: &str) -> Option<ConnectionStatus> {
        self.inner
            .registry
            .lock()
            .connections
            .get(url)
            .map(|connection| connection.status())
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.inner.registry.lock().connections.len()
    }

    /// Whether a reconnect is scheduled for `url`.
    pub fn is_reconnecting(&self, url: &str) -> bool {
        self.inner.registry.lock().reconnects.contains_key(url)
    }
}

impl ManagerInner {
    fn connect(self: &Arc<Self>, url: &str, from_reconnect: bool) -> Arc<Connection> {
        let mut registry = self.registry.lock();

        if let Some(existing) = registry.connections.get(url)
            && existing.state().is_live()
        {
            return Arc::clone(existing);
        }

        if let Some(handle) = registry.reconnects.remove(url)
            && !from_reconnect
        {
            handle.abort();
        }

        let capacity = self.config.history_capacity;
        let hub = Arc::clone(
            registry
                .hubs
                .entry(url.to_string())
                .or_insert_with(|| Hub::new(url, capacity)),
        );

        let manager = Arc::downgrade(self);
        let connection = Connection::open(
            url,
            hub,
            &self.config,
            Box::new(move |connection, outcome| {
                if let Some(manager) = manager.upgrade() {
                    manager.on_closed(connection, outcome);
                }
            }),
        );
        registry
            .connections
            .insert(url.to_string(), Arc::clone(&connection));
        connection
    }

    fn on_closed(self: &Arc<Self>, connection: &Arc<Connection>, outcome: &CloseOutcome) {
        let url = connection.url();
        let mut registry = self.registry.lock();

        let is_current = registry
            .connections
            .get(url)
            .is_some_and(|registered| Arc::ptr_eq(registered, connection));
        if !is_current {
            return;
        }
        registry.connections.remove(url);

        if matches!(outcome, CloseOutcome::Clean) || connection.is_closing() {
            registry.hubs.remove(url);
            return;
        }

        let delay = self.config.reconnect_delay;
        tracing::warn!(url, delay_ms = delay.as_millis() as u64, "Scheduling stream reconnect");

        let manager: Weak<Self> = Arc::downgrade(self);
        let key = url.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = manager.upgrade() {
                tracing::info!(url = %key, "Reconnecting stream");
                manager.connect(&key, true);
            }
        });
        if let Some(previous) = registry.reconnects.insert(url.to_string(), handle) {
            previous.abort();
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let registry = self.registry.get_mut();
        for (_, handle) in registry.reconnects.drain() {
            handle.abort();
        }
        for (_, connection) in registry.connections.drain() {
            connection.close();
        }
    }
}
