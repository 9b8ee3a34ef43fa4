//! Per-URL subscriber registry, message history and replay.
//!
//! A [`Hub`] outlives the physical connections made for its URL, so a
//! reconnect keeps every subscriber and the buffered history.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use super::{
    history::MessageHistory,
    types::{ConnectionStatus, StreamMessage},
};

pub(crate) type MessageCallback = Arc<dyn Fn(&StreamMessage) + Send + Sync>;
pub(crate) type StatusCallback = Arc<dyn Fn(&ConnectionStatus) + Send + Sync>;

enum Delivery {
    /// History replay still running; live messages wait here.
    Replaying(Vec<StreamMessage>),
    Live,
}

struct Subscriber {
    id: u64,
    callback: MessageCallback,
    active: AtomicBool,
    delivery: Mutex<Delivery>,
}

impl Subscriber {
    fn deliver(&self, message: &StreamMessage) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        {
            let mut delivery = self.delivery.lock();
            if let Delivery::Replaying(pending) = &mut *delivery {
                pending.push(message.clone());
                return;
            }
        }
        guarded(self.id, || (self.callback)(message));
    }

    /// Deliver `history`, then everything queued meanwhile, then go live.
    fn replay(&self, history: Vec<StreamMessage>) {
        let mut batch = history;
        loop {
            for message in &batch {
                if !self.active.load(Ordering::Acquire) {
                    return;
                }
                guarded(self.id, || (self.callback)(message));
            }

            let mut delivery = self.delivery.lock();
            match &mut *delivery {
                Delivery::Replaying(pending) if !pending.is_empty() => {
                    batch = std::mem::take(pending);
                }
                _ => {
                    *delivery = Delivery::Live;
                    return;
                }
            }
        }
    }
}

/// Run a user callback. A panic is logged and goes no further.
fn guarded(subscriber: u64, callback: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        tracing::error!(subscriber, "Subscriber callback panicked");
    }
}

struct StatusSubscriber {
    id: u64,
    callback: StatusCallback,
}

struct HubState {
    subscribers: Vec<Arc<Subscriber>>,
    status_subscribers: Vec<Arc<StatusSubscriber>>,
    history: MessageHistory,
}

/// Subscribers, status subscribers and history for one URL.
pub(crate) struct Hub {
    url: String,
    next_id: AtomicU64,
    state: Mutex<HubState>,
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Hub")
            .field("url", &self.url)
            .field("subscribers", &state.subscribers.len())
            .field("status_subscribers", &state.status_subscribers.len())
            .field("history", &state.history.len())
            .finish()
    }
}

impl Hub {
    pub(crate) fn new(url: impl Into<String>, history_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            next_id: AtomicU64::new(1),
            state: Mutex::new(HubState {
                subscribers: Vec::new(),
                status_subscribers: Vec::new(),
                history: MessageHistory::new(history_capacity),
            }),
        })
    }

    /// Register a message callback. With `replay`, the history is captured
    /// in the same critical section as the registration and replayed on a
    /// spawned task before any live message reaches this subscriber.
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        callback: MessageCallback,
        replay: bool,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            id,
            callback,
            active: AtomicBool::new(true),
            delivery: Mutex::new(if replay {
                Delivery::Replaying(Vec::new())
            } else {
                Delivery::Live
            }),
        });

        let history = {
            let mut state = self.state.lock();
            state.subscribers.push(Arc::clone(&subscriber));
            replay.then(|| state.history.snapshot())
        };

        if let Some(history) = history {
            tracing::debug!(
                url = %self.url,
                subscriber = id,
                messages = history.len(),
                "Replaying history"
            );
            tokio::spawn(async move { subscriber.replay(history) });
        }

        Subscription::new(self, SubscriptionKind::Message(id))
    }

    pub(crate) fn subscribe_status(self: &Arc<Self>, callback: StatusCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.state
            .lock()
            .status_subscribers
            .push(Arc::new(StatusSubscriber { id, callback }));
        Subscription::new(self, SubscriptionKind::Status(id))
    }

    /// Record `message` and fan it out in registration order.
    pub(crate) fn publish(&self, message: StreamMessage) {
        let subscribers = {
            let mut state = self.state.lock();
            state.history.push(message.clone());
            state.subscribers.clone()
        };
        for subscriber in subscribers {
            subscriber.deliver(&message);
        }
    }

    pub(crate) fn notify_status(&self, status: &ConnectionStatus) {
        let subscribers = self.state.lock().status_subscribers.clone();
        for subscriber in subscribers {
            guarded(subscriber.id, || (subscriber.callback)(status));
        }
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub(crate) fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }

    fn remove(&self, kind: SubscriptionKind) {
        let mut state = self.state.lock();
        match kind {
            SubscriptionKind::Message(id) => {
                state.subscribers.retain(|subscriber| {
                    if subscriber.id == id {
                        subscriber.active.store(false, Ordering::Release);
                        false
                    } else {
                        true
                    }
                });
            }
            SubscriptionKind::Status(id) => {
                state.status_subscribers.retain(|subscriber| subscriber.id != id);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SubscriptionKind {
    Message(u64),
    Status(u64),
}

/// Disposer for a message or status callback.
///
/// Dropping it unsubscribes; [`Subscription::unsubscribe`] does the same
/// explicitly and may be called any number of times. Neither closes the
/// underlying connection.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    hub: Weak<Hub>,
    kind: SubscriptionKind,
    done: AtomicBool,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Subscription {
    fn new(hub: &Arc<Hub>, kind: SubscriptionKind) -> Self {
        Self {
            hub: Arc::downgrade(hub),
            kind,
            done: AtomicBool::new(false),
        }
    }

    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.kind);
        }
    }

    pub fn is_active(&self) -> bool {
        !self.done.load(Ordering::Acquire)
    }

    /// Keep the callback registered for the lifetime of the hub.
    pub fn forget(self) {
        std::mem::forget(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
