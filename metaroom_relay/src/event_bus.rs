// In-process publish/subscribe hub keyed by channel name.
//
// `EventBus<E>` is the one fan-out primitive in the crate. The client uses an
// `EventBus<Envelope>` keyed by message kind to deliver relay traffic to
// application code and to the lock registry; the relay's file watcher uses an
// `EventBus<FileEvent>` keyed by `add` / `change` / `unlink` to hand
// filesystem notifications to the server loop.
//
// Semantics:
// - Subscribers on a channel are invoked in subscription order.
// - One-shot subscribers are removed before any callback runs, so a one-shot
//   fires exactly once even if its callback publishes re-entrantly.
// - The subscriber list is snapshotted under the lock and callbacks run with
//   the lock released. Subscribing or unsubscribing from inside a callback
//   is allowed and affects only later publishes.
// - A panicking callback is caught and logged; the remaining subscribers
//   still run.
// - Publishing on a channel with no subscribers is not an error. It returns
//   0 and emits a debug diagnostic.
// - Channels whose last subscriber leaves are pruned.
//
// The handle is cheap to clone; clones share one registry.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

/// Opaque handle identifying one subscription. Unique per bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Subscriber<E> {
    callback: Callback<E>,
    one_shot: bool,
}

struct Registry<E> {
    // Inner map is keyed by id, and ids increase, so iteration order is
    // subscription order.
    channels: BTreeMap<String, BTreeMap<SubscriptionId, Subscriber<E>>>,
    next_id: u64,
}

pub struct EventBus<E> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        EventBus {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        EventBus {
            registry: Arc::new(Mutex::new(Registry {
                channels: BTreeMap::new(),
                next_id: 0,
            })),
        }
    }

    /// Register a durable subscriber on `channel`.
    pub fn subscribe<F>(&self, channel: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.insert(channel, Arc::new(callback), false)
    }

    /// Register a subscriber that is removed after its first delivery.
    pub fn subscribe_one_shot<F>(&self, channel: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.insert(channel, Arc::new(callback), true)
    }

    fn insert(&self, channel: &str, callback: Callback<E>, one_shot: bool) -> SubscriptionId {
        let mut registry = self.registry.lock();
        let id = SubscriptionId(registry.next_id);
        registry.next_id += 1;
        registry
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(id, Subscriber { callback, one_shot });
        id
    }

    /// Remove one subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> bool {
        let mut guard = self.registry.lock();
        let registry = &mut *guard;
        let Some(subscribers) = registry.channels.get_mut(channel) else {
            return false;
        };
        let removed = subscribers.remove(&id).is_some();
        if subscribers.is_empty() {
            registry.channels.remove(channel);
        }
        removed
    }

    /// Remove every subscription on every channel.
    pub fn unsubscribe_all(&self) {
        self.registry.lock().channels.clear();
    }

    /// Deliver `event` to every subscriber of `channel`. Returns how many
    /// callbacks were invoked.
    pub fn publish(&self, channel: &str, event: &E) -> usize {
        let snapshot: Vec<(SubscriptionId, Callback<E>)> = {
            let mut guard = self.registry.lock();
            let registry = &mut *guard;
            let Some(subscribers) = registry.channels.get_mut(channel) else {
                debug!(channel, delivered = 0, "no subscribers for channel");
                return 0;
            };
            let snapshot = subscribers
                .iter()
                .map(|(id, sub)| (*id, Arc::clone(&sub.callback)))
                .collect();
            subscribers.retain(|_, sub| !sub.one_shot);
            if subscribers.is_empty() {
                registry.channels.remove(channel);
            }
            snapshot
        };

        for (id, callback) in &snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!(channel, subscription = id.0, "subscriber panicked");
            }
        }
        snapshot.len()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.registry
            .lock()
            .channels
            .get(channel)
            .map_or(0, BTreeMap::len)
    }

    pub fn channel_count(&self) -> usize {
        self.registry.lock().channels.len()
    }
}
