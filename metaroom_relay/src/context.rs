// Client session: one connection, its event bus, and its lock registry.
//
// `ClientSession` is the explicit replacement for a process-wide singleton.
// Construct one per relay link and pass it to whatever needs it. It wires:
// - a `ConnectionManager` publishing inbound envelopes on the session's bus,
// - a `LockRegistry` subscribed to lock traffic on that bus,
// - an `Identity` learned from the relay's greeting (`Init.uid` from the
//   front-end relay, `initialize.id` from the object-sync relay).
//
// Every reconnect yields a fresh greeting and usually a new id. When the id
// changes, the lock registry drops ownership recorded for the old one.
//
// Dropping the session aborts the link and clears every subscription.

use std::sync::Arc;
use std::time::Duration;

use metaroom_protocol::{
    ConnectionId, Envelope, InitPayload, InitializePayload, MessageKind, ObjectId, TagKey,
};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::client::{ConnectionConfig, ConnectionManager, EnvelopeSink};
use crate::error::ClientError;
use crate::event_bus::EventBus;
use crate::lock::{Lock, LockRegistry};

/// The connection id the relay assigned to this client, if known yet.
#[derive(Clone, Debug)]
pub struct Identity {
    id: Arc<watch::Sender<Option<ConnectionId>>>,
}

impl Default for Identity {
    fn default() -> Self {
        let (id, _) = watch::channel(None);
        Identity { id: Arc::new(id) }
    }
}

impl Identity {
    pub fn get(&self) -> Option<ConnectionId> {
        *self.id.borrow()
    }

    /// Record a new id. Returns the previous one.
    pub fn set(&self, id: ConnectionId) -> Option<ConnectionId> {
        self.id.send_replace(Some(id))
    }

    /// Wait until an id other than `stale` is known. Returns `None` on
    /// timeout.
    pub async fn wait_for_new(
        &self,
        stale: Option<ConnectionId>,
        timeout: Duration,
    ) -> Option<ConnectionId> {
        let mut rx = self.id.subscribe();
        let found = tokio::time::timeout(timeout, async move {
            rx.wait_for(|id| id.is_some() && *id != stale)
                .await
                .ok()
                .and_then(|id| *id)
        })
        .await;
        found.ok().flatten()
    }

    pub async fn wait(&self, timeout: Duration) -> Option<ConnectionId> {
        self.wait_for_new(None, timeout).await
    }
}

pub struct ClientSession {
    tag_key: TagKey,
    bus: EventBus<Envelope>,
    connection: ConnectionManager,
    locks: LockRegistry,
    identity: Identity,
}

impl ClientSession {
    /// A session speaking the object-sync dialect (`type` tag).
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_dialect(config, TagKey::Type)
    }

    pub fn with_dialect(config: ConnectionConfig, tag_key: TagKey) -> Self {
        let bus = EventBus::new();
        let connection = ConnectionManager::new(config, bus.clone());
        let identity = Identity::default();
        let sink: Arc<dyn EnvelopeSink> = Arc::new(connection.clone());
        let locks = LockRegistry::new(sink, identity.clone(), tag_key);
        locks.attach(&bus);

        {
            let identity = identity.clone();
            let locks = locks.clone();
            bus.subscribe(MessageKind::Init.as_str(), move |envelope: &Envelope| {
                match envelope.payload::<InitPayload>() {
                    Ok(init) => adopt_id(&identity, &locks, init.uid),
                    Err(e) => warn!(error = %e, "bad Init greeting"),
                }
            });
        }
        {
            let identity = identity.clone();
            let locks = locks.clone();
            bus.subscribe(MessageKind::Initialize.as_str(), move |envelope: &Envelope| {
                match envelope.payload::<InitializePayload>() {
                    Ok(initialize) => {
                        adopt_id(&identity, &locks, initialize.id);
                        locks.seed(&initialize.objects);
                    }
                    Err(e) => warn!(error = %e, "bad initialize greeting"),
                }
            });
        }

        ClientSession {
            tag_key,
            bus,
            connection,
            locks,
            identity,
        }
    }

    pub fn connect(&self, host: &str, port: u16) {
        self.connection.connect(host, port);
    }

    pub fn connect_url(&self, url: impl Into<String>) {
        self.connection.connect_url(url);
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }

    pub fn send(&self, envelope: &Envelope) -> Result<(), ClientError> {
        self.connection.send(envelope)
    }

    /// Envelope in this session's dialect with an empty body.
    pub fn envelope(&self, kind: impl Into<String>) -> Envelope {
        Envelope::new(self.tag_key, kind)
    }

    pub fn bus(&self) -> &EventBus<Envelope> {
        &self.bus
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub fn lock_for(&self, object: impl Into<ObjectId>) -> Lock {
        self.locks.lock_for(object)
    }

    pub fn self_id(&self) -> Option<ConnectionId> {
        self.identity.get()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub async fn wait_for_identity(&self, timeout: Duration) -> Option<ConnectionId> {
        self.identity.wait(timeout).await
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.bus.unsubscribe_all();
        self.connection.abort();
    }
}

fn adopt_id(identity: &Identity, locks: &LockRegistry, id: ConnectionId) {
    let previous = identity.set(id);
    if previous != Some(id) {
        info!(%id, ?previous, "relay assigned connection id");
        locks.identity_changed(previous);
    }
}
