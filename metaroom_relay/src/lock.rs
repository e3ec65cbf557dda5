// Client-side view of shared-object ownership.
//
// `LockRegistry` caches, per object, the owner the relay last announced and
// whether this client has a lock request in flight. The cache is corrected
// only by authoritative relay traffic (`lock` / `release` verdicts, `spawn` /
// `delete` broadcasts and departure notices); `Lock::lock()` never assumes
// success on its own. A successful `spawn` makes the spawner the owner.
//
// Flow for `lock()`:
// - already ours       → `Held`, nothing sent
// - owned by someone   → `Unavailable`, nothing sent
// - request in flight  → `Pending`, nothing re-sent
// - otherwise          → send `lock {uid, lockid: self}`, mark pending,
//                        return `Pending`; the relay's verdict settles it.
//
// `unlock()` clears local ownership and sends `release`; the relay's
// broadcast confirms it to everyone else.
//
// Outbound traffic goes through `EnvelopeSink`, so the registry can be driven
// without sockets in tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use metaroom_protocol::{
    ConnectionId, Envelope, LeavePayload, LockRequest, LockResult, MessageKind, ObjectId,
    ObjectResult, TagKey, UserLeavePayload,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::client::EnvelopeSink;
use crate::context::Identity;
use crate::error::ClientError;
use crate::event_bus::{EventBus, SubscriptionId};

/// Channels the registry listens on.
const CHANNELS: [&str; 6] = ["lock", "release", "spawn", "delete", "leave", "User_Leave"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockAttempt {
    /// This client already owns the object.
    Held,
    /// A request is in flight; wait for the relay's verdict.
    Pending,
    /// Another client owns the object. Nothing was sent.
    Unavailable,
}

#[derive(Clone, Copy, Debug, Default)]
struct LockEntry {
    owner: Option<ConnectionId>,
    pending: bool,
}

#[derive(Clone)]
pub struct LockRegistry {
    entries: Arc<Mutex<BTreeMap<ObjectId, LockEntry>>>,
    sink: Arc<dyn EnvelopeSink>,
    identity: Identity,
    tag_key: TagKey,
}

impl LockRegistry {
    pub fn new(sink: Arc<dyn EnvelopeSink>, identity: Identity, tag_key: TagKey) -> Self {
        LockRegistry {
            entries: Arc::new(Mutex::new(BTreeMap::new())),
            sink,
            identity,
            tag_key,
        }
    }

    pub fn lock_for(&self, object: impl Into<ObjectId>) -> Lock {
        Lock {
            object: object.into(),
            registry: self.clone(),
        }
    }

    /// Subscribe the registry to relay traffic on `bus`.
    pub fn attach(&self, bus: &EventBus<Envelope>) -> Vec<(&'static str, SubscriptionId)> {
        CHANNELS
            .iter()
            .map(|&channel| {
                let registry = self.clone();
                let id = bus.subscribe(channel, move |envelope: &Envelope| registry.apply(envelope));
                (channel, id)
            })
            .collect()
    }

    pub fn owner(&self, object: &ObjectId) -> Option<ConnectionId> {
        self.entries.lock().get(object).and_then(|entry| entry.owner)
    }

    pub fn is_pending(&self, object: &ObjectId) -> bool {
        self.entries
            .lock()
            .get(object)
            .is_some_and(|entry| entry.pending)
    }

    /// Fold one relay message into the cache.
    pub fn apply(&self, envelope: &Envelope) {
        match envelope.message_kind() {
            MessageKind::Lock => match envelope.payload::<LockResult>() {
                Ok(result) => self.on_lock_verdict(result),
                Err(e) => warn!(error = %e, "ignoring bad lock verdict"),
            },
            MessageKind::Release => match envelope.payload::<LockResult>() {
                Ok(result) => self.on_release_verdict(result),
                Err(e) => warn!(error = %e, "ignoring bad release verdict"),
            },
            MessageKind::Spawn => match envelope.payload::<ObjectResult>() {
                Ok(result) => self.on_spawned(result),
                Err(e) => warn!(error = %e, "ignoring bad spawn verdict"),
            },
            MessageKind::Delete => match envelope.payload::<ObjectResult>() {
                Ok(result) if result.success => {
                    self.entries.lock().remove(&result.uid);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "ignoring bad delete verdict"),
            },
            MessageKind::Leave => {
                if let Ok(leave) = envelope.payload::<LeavePayload>() {
                    self.forget_owner(leave.user);
                }
            }
            MessageKind::UserLeave => {
                if let Ok(leave) = envelope.payload::<UserLeavePayload>() {
                    self.forget_owner(leave.info.uid);
                }
            }
            _ => {}
        }
    }

    fn on_lock_verdict(&self, result: LockResult) {
        let me = self.identity.get();
        let mut entries = self.entries.lock();
        let entry = entries.entry(result.uid.clone()).or_default();
        if result.success {
            entry.owner = result.lockid;
            // Someone else's grant leaves our own request in flight; the
            // relay's rejection to us follows.
            if result.lockid.is_none() || result.lockid == me {
                entry.pending = false;
            }
        } else {
            entry.pending = false;
            if result.lockid.is_some() {
                entry.owner = result.lockid;
            }
        }
        debug!(object = %result.uid, owner = ?entry.owner, success = result.success, "lock verdict");
    }

    fn on_release_verdict(&self, result: LockResult) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(result.uid).or_default();
        entry.owner = if result.success { None } else { result.lockid };
    }

    fn on_spawned(&self, result: ObjectResult) {
        if !result.success {
            return;
        }
        let mut entries = self.entries.lock();
        let entry = entries.entry(result.uid).or_default();
        entry.owner = result.lockid;
        entry.pending = false;
    }

    /// Drop every ownership recorded for a departed connection.
    pub fn forget_owner(&self, owner: ConnectionId) {
        for entry in self.entries.lock().values_mut() {
            if entry.owner == Some(owner) {
                entry.owner = None;
            }
        }
    }

    /// Our connection id changed (reconnect). The relay released whatever the
    /// old id held, and requests sent on the old link are void.
    pub fn identity_changed(&self, previous: Option<ConnectionId>) {
        for entry in self.entries.lock().values_mut() {
            entry.pending = false;
            if previous.is_some() && entry.owner == previous {
                entry.owner = None;
            }
        }
    }

    /// Seed owners from an `initialize` object snapshot.
    pub fn seed(&self, objects: &Map<String, Value>) {
        let mut entries = self.entries.lock();
        for (key, object) in objects {
            let owner = object
                .get("lockid")
                .and_then(Value::as_u64)
                .map(ConnectionId);
            entries.entry(ObjectId::from_key(key)).or_default().owner = owner;
        }
    }

    fn request_lock(&self, object: &ObjectId) -> Result<LockAttempt, ClientError> {
        let me = self.identity.get().ok_or(ClientError::NoIdentity)?;
        let request = Envelope::from_payload(
            self.tag_key,
            MessageKind::Lock.as_str(),
            &LockRequest::new(object.clone(), me),
        )?;
        {
            let mut entries = self.entries.lock();
            let entry = entries.entry(object.clone()).or_default();
            match entry.owner {
                Some(owner) if owner == me => return Ok(LockAttempt::Held),
                Some(_) => return Ok(LockAttempt::Unavailable),
                None if entry.pending => return Ok(LockAttempt::Pending),
                None => entry.pending = true,
            }
        }
        if let Err(e) = self.sink.send_envelope(&request) {
            if let Some(entry) = self.entries.lock().get_mut(object) {
                entry.pending = false;
            }
            return Err(e);
        }
        Ok(LockAttempt::Pending)
    }

    fn request_release(&self, object: &ObjectId) -> Result<bool, ClientError> {
        let me = self.identity.get().ok_or(ClientError::NoIdentity)?;
        let request = Envelope::from_payload(
            self.tag_key,
            MessageKind::Release.as_str(),
            &LockRequest::new(object.clone(), me),
        )?;
        {
            let mut entries = self.entries.lock();
            match entries.get_mut(object) {
                Some(entry) if entry.owner == Some(me) => entry.owner = None,
                _ => return Ok(false),
            }
        }
        self.sink.send_envelope(&request)?;
        Ok(true)
    }
}

/// Handle on one shared object's lock.
#[derive(Clone)]
pub struct Lock {
    object: ObjectId,
    registry: LockRegistry,
}

impl Lock {
    pub fn object(&self) -> &ObjectId {
        &self.object
    }

    pub fn owner(&self) -> Option<ConnectionId> {
        self.registry.owner(&self.object)
    }

    /// True iff the relay last said this client owns the object.
    pub fn locked(&self) -> bool {
        match self.registry.identity.get() {
            Some(me) => self.owner() == Some(me),
            None => false,
        }
    }

    /// True iff nobody owns the object.
    pub fn available(&self) -> bool {
        self.owner().is_none()
    }

    pub fn pending(&self) -> bool {
        self.registry.is_pending(&self.object)
    }

    pub fn lock(&self) -> Result<LockAttempt, ClientError> {
        self.registry.request_lock(&self.object)
    }

    /// Give up ownership. Returns false (and sends nothing) if this client
    /// does not hold the lock.
    pub fn unlock(&self) -> Result<bool, ClientError> {
        self.registry.request_release(&self.object)
    }
}
