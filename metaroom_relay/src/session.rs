// Session state for a relay.
//
// `Session` is the central data structure that `server.rs` drives. It owns
// the connection registry, the world pointer, the lock table / object store,
// the avatar poses and the filesystem bridge. All mutation happens through
// methods called from the server's single control loop; no internal
// locking. That single-writer property is what makes lock arbitration
// sound: two `lock` requests for one object are always handled one after the
// other, in arrival order.
//
// Key responsibilities:
// - Connection lifecycle: register with a role-specific greeting, deregister
//   with lock cleanup and a role-specific departure notice. Stale
//   connections found by the heartbeat sweep get the same cleanup.
// - Dispatch: decode each inbound frame into an `Envelope` and route it by
//   kind. Malformed frames and invalid payloads are logged and dropped; the
//   sender stays connected and nobody else is affected.
// - Broadcast: state updates go to every connection except the sender;
//   `Load_World`, lock verdicts and object results go to everyone; rejected
//   requests are answered to the requester only.
// - Periodic traffic (object-sync role): `tick` and aggregated `avatar`.
//
// Frames whose payload the relay does not interpret (`Echo`, `Load_World`,
// `User_State`) are forwarded as the exact text received.
//
// Writing to clients: `Session` never touches sockets. Every outgoing frame
// is queued on the connection's `Outbound` channel via the registry and the
// connection's writer task does the I/O.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::Local;
use metaroom_protocol::{
    AvatarBroadcast, AvatarUpdate, ConnectionId, Envelope, FileListPayload, InitPayload,
    InitializePayload, JoinPayload, LeavePayload, LoadWorldPayload, LockRequest, LockResult,
    MessageKind, ObjectId, ObjectResult, ObjectUpdate, TagKey, TickPayload, UpdateFilePayload,
    UserInfo, UserLeavePayload, WorldIndex, WriteFilesPayload,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::files::FileBridge;
use crate::locks::{LockOutcome, LockTable, ReleaseOutcome};
use crate::registry::{ConnectionRegistry, Outbound};

pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Which relay this session backs. The role picks the greeting, the
/// departure notice, the tag dialect of relay-originated notices, and
/// whether periodic traffic is sent. Both roles accept every message kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayRole {
    FrontEnd,
    ObjectSync,
}

impl RelayRole {
    pub fn tag_key(self) -> TagKey {
        match self {
            RelayRole::FrontEnd => TagKey::MrMessage,
            RelayRole::ObjectSync => TagKey::Type,
        }
    }
}

pub struct Session {
    role: RelayRole,
    world_index: WorldIndex,
    registry: ConnectionRegistry,
    objects: LockTable,
    avatars: BTreeMap<ConnectionId, Value>,
    files: FileBridge,
}

impl Session {
    pub fn new(role: RelayRole, files: FileBridge) -> Self {
        Session {
            role,
            world_index: WorldIndex::default(),
            registry: ConnectionRegistry::new(),
            objects: LockTable::new(),
            avatars: BTreeMap::new(),
            files,
        }
    }

    pub fn role(&self) -> RelayRole {
        self.role
    }

    pub fn world_index(&self) -> WorldIndex {
        self.world_index
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn owner_of(&self, object: &ObjectId) -> Option<ConnectionId> {
        self.objects.owner(object)
    }

    pub fn avatar_count(&self) -> usize {
        self.avatars.len()
    }

    /// Register a newly opened connection and greet it.
    pub fn add_connection(&mut self, outbound: UnboundedSender<Outbound>, now: Instant) -> ConnectionId {
        let id = self.registry.register(outbound, now);
        info!(
            conn = %id,
            role = ?self.role,
            connections = self.registry.len(),
            "connection registered"
        );
        match self.role {
            RelayRole::FrontEnd => self.send_init(id),
            RelayRole::ObjectSync => {
                let avatars = self.avatar_map();
                let initialize = InitializePayload {
                    id,
                    objects: self.objects.snapshot(),
                    avatars,
                };
                if let Some(text) = encode(TagKey::Type, MessageKind::Initialize, &initialize) {
                    self.registry.send_to(id, Outbound::Text(text));
                }
                if let Some(text) = encode(TagKey::Type, MessageKind::Join, &JoinPayload { id }) {
                    self.registry.broadcast_except(id, &text);
                }
            }
        }
        id
    }

    /// Deregister a connection: release its locks, forget its avatar and
    /// tell everyone else it left. A second call for the same id is a no-op.
    pub fn remove_connection(&mut self, id: ConnectionId) {
        if self.registry.deregister(id).is_none() {
            return;
        }
        let tag_key = self.role.tag_key();
        for uid in self.objects.release_all(id) {
            debug!(conn = %id, object = %uid, "releasing lock of departed connection");
            let notice = LockResult {
                uid,
                lockid: None,
                success: true,
            };
            if let Some(text) = encode(tag_key, MessageKind::Release, &notice) {
                self.registry.broadcast(&text);
            }
        }
        self.avatars.remove(&id);

        let departure = match self.role {
            RelayRole::FrontEnd => encode(
                tag_key,
                MessageKind::UserLeave,
                &UserLeavePayload {
                    info: UserInfo { uid: id },
                },
            ),
            RelayRole::ObjectSync => {
                encode(tag_key, MessageKind::Leave, &LeavePayload { user: id })
            }
        };
        if let Some(text) = departure {
            self.registry.broadcast(&text);
        }
        info!(conn = %id, connections = self.registry.len(), "connection removed");
    }

    /// Queue a Close frame for `id`, then clean it up as for any close.
    pub fn close_connection(&mut self, id: ConnectionId, code: u16, reason: &str) {
        self.registry.close(id, code, reason);
        self.remove_connection(id);
    }

    /// Record liveness without a message (pings and pongs).
    pub fn touch(&mut self, id: ConnectionId, now: Instant) {
        self.registry.touch(id, now);
    }

    pub fn ping_all(&mut self) {
        self.registry.ping_all();
    }

    /// Close every connection silent for longer than `timeout`.
    pub fn reap_stale(&mut self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        let stale = self.registry.stale(now, timeout);
        for &id in &stale {
            warn!(conn = %id, ?timeout, "heartbeat timeout; closing connection");
            self.close_connection(id, CLOSE_GOING_AWAY, "heartbeat timeout");
        }
        stale
    }

    /// Send a going-away Close to everyone and forget them, without
    /// departure notices. Used on relay shutdown; clients reconnect.
    pub fn close_all(&mut self) {
        for id in self.registry.ids() {
            self.registry.close(id, CLOSE_GOING_AWAY, "relay shutting down");
            self.registry.deregister(id);
        }
    }

    /// Periodic traffic. Only the object-sync role sends any.
    pub fn periodic_broadcast(&mut self, now_millis: u64) {
        if self.role != RelayRole::ObjectSync || self.registry.is_empty() {
            return;
        }
        if let Some(text) = encode(TagKey::Type, MessageKind::Tick, &TickPayload { time: now_millis }) {
            self.registry.broadcast(&text);
        }
        if !self.avatars.is_empty() {
            let data = AvatarBroadcast {
                data: self.avatar_map(),
            };
            if let Some(text) = encode(TagKey::Type, MessageKind::Avatar, &data) {
                self.registry.broadcast(&text);
            }
        }
    }

    /// A watched file changed on disk: push its new content to everyone.
    pub fn file_changed(&mut self, path: &Path) {
        let content = match self.files.read(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(error = %e, "cannot read changed file");
                return;
            }
        };
        let update = UpdateFilePayload {
            file: self.files.client_name(path),
            content,
        };
        if let Some(text) = encode(TagKey::MrMessage, MessageKind::UpdateFile, &update) {
            let delivered = self.registry.broadcast(&text);
            info!(file = %update.file, delivered, "broadcast file update");
        }
    }

    /// Handle one inbound text frame from `sender`.
    pub fn handle_text(&mut self, sender: ConnectionId, text: &str, now: Instant) {
        if !self.registry.contains(sender) {
            debug!(conn = %sender, "frame from unregistered connection dropped");
            return;
        }
        self.registry.touch(sender, now);
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(conn = %sender, error = %e, "dropping malformed frame");
                return;
            }
        };
        debug!(conn = %sender, kind = envelope.kind(), "message");

        match envelope.message_kind() {
            MessageKind::Echo => {
                self.registry.send_to(sender, Outbound::Text(text.to_string()));
            }
            MessageKind::LoadWorld => self.handle_load_world(sender, text, &envelope),
            MessageKind::UserState => {
                self.registry.broadcast_except(sender, text);
            }
            MessageKind::Init => self.send_init(sender),
            MessageKind::WriteFiles => self.handle_write_files(sender, &envelope),
            MessageKind::WatchFiles => self.handle_watch(sender, &envelope, true),
            MessageKind::UnwatchFiles => self.handle_watch(sender, &envelope, false),
            MessageKind::Lock => self.handle_lock(sender, &envelope),
            MessageKind::Release => self.handle_release(sender, &envelope),
            MessageKind::Object => self.handle_object(sender, &envelope),
            MessageKind::Spawn => self.handle_spawn(sender, &envelope),
            MessageKind::Delete => self.handle_delete(sender, &envelope),
            MessageKind::Avatar => self.handle_avatar(sender, &envelope),
            MessageKind::UserLeave
            | MessageKind::UpdateFile
            | MessageKind::Initialize
            | MessageKind::Join
            | MessageKind::Leave
            | MessageKind::Tick => {
                debug!(conn = %sender, kind = envelope.kind(), "relay-originated kind from client ignored");
            }
            MessageKind::Other(kind) => {
                warn!(conn = %sender, %kind, "unknown message kind ignored");
            }
        }
    }

    fn send_init(&mut self, id: ConnectionId) {
        let init = InitPayload {
            key: self.world_index,
            uid: id,
        };
        if let Some(text) = encode(TagKey::MrMessage, MessageKind::Init, &init) {
            self.registry.send_to(id, Outbound::Text(text));
        }
    }

    fn handle_load_world(&mut self, sender: ConnectionId, text: &str, envelope: &Envelope) {
        let Some(load) = decode::<LoadWorldPayload>(sender, envelope) else {
            return;
        };
        self.world_index = load.key;
        let delivered = self.registry.broadcast(text);
        info!(conn = %sender, world = load.key.0, delivered, "world changed");
    }

    fn handle_write_files(&mut self, sender: ConnectionId, envelope: &Envelope) {
        let Some(batch) = decode::<WriteFilesPayload>(sender, envelope) else {
            return;
        };
        self.files.write_files(&batch.files, Local::now());
    }

    fn handle_watch(&mut self, sender: ConnectionId, envelope: &Envelope, watch: bool) {
        let Some(list) = decode::<FileListPayload>(sender, envelope) else {
            return;
        };
        for file in &list.files {
            let result = if watch {
                self.files.watch(file)
            } else {
                self.files.unwatch(file)
            };
            if let Err(e) = result {
                warn!(conn = %sender, %file, watch, error = %e, "watch request failed");
            }
        }
    }

    fn handle_lock(&mut self, sender: ConnectionId, envelope: &Envelope) {
        let Some(request) = decode::<LockRequest>(sender, envelope) else {
            return;
        };
        let tag_key = envelope.tag_key();
        if is_impersonation(sender, &request) {
            warn!(conn = %sender, object = %request.uid, "lock request names another connection");
            let owner = self.objects.owner(&request.uid);
            self.reply_lock(sender, tag_key, MessageKind::Lock, request.uid, owner);
            return;
        }
        match self.objects.acquire(&request.uid, sender) {
            LockOutcome::Granted => {
                debug!(conn = %sender, object = %request.uid, "lock granted");
                let result = LockResult {
                    uid: request.uid,
                    lockid: Some(sender),
                    success: true,
                };
                if let Some(text) = encode(tag_key, MessageKind::Lock, &result) {
                    self.registry.broadcast(&text);
                }
            }
            LockOutcome::Held { owner } => {
                debug!(conn = %sender, object = %request.uid, %owner, "lock denied");
                self.reply_lock(sender, tag_key, MessageKind::Lock, request.uid, Some(owner));
            }
        }
    }

    fn handle_release(&mut self, sender: ConnectionId, envelope: &Envelope) {
        let Some(request) = decode::<LockRequest>(sender, envelope) else {
            return;
        };
        let tag_key = envelope.tag_key();
        if is_impersonation(sender, &request) {
            warn!(conn = %sender, object = %request.uid, "release request names another connection");
            let owner = self.objects.owner(&request.uid);
            self.reply_lock(sender, tag_key, MessageKind::Release, request.uid, owner);
            return;
        }
        match self.objects.release(&request.uid, sender) {
            ReleaseOutcome::Released => {
                let result = LockResult {
                    uid: request.uid,
                    lockid: Some(sender),
                    success: true,
                };
                if let Some(text) = encode(tag_key, MessageKind::Release, &result) {
                    self.registry.broadcast(&text);
                }
            }
            ReleaseOutcome::NotOwner { owner } => {
                self.reply_lock(sender, tag_key, MessageKind::Release, request.uid, owner);
            }
        }
    }

    /// Failure verdict to the requester only, naming the current owner.
    fn reply_lock(
        &mut self,
        to: ConnectionId,
        tag_key: TagKey,
        kind: MessageKind,
        uid: ObjectId,
        owner: Option<ConnectionId>,
    ) {
        let result = LockResult {
            uid,
            lockid: owner,
            success: false,
        };
        if let Some(text) = encode(tag_key, kind, &result) {
            self.registry.send_to(to, Outbound::Text(text));
        }
    }

    fn handle_object(&mut self, sender: ConnectionId, envelope: &Envelope) {
        let Some(update) = decode::<ObjectUpdate>(sender, envelope) else {
            return;
        };
        if self.objects.update(&update.uid, sender, update.state.clone()) {
            let result = ObjectResult {
                lockid: self.objects.owner(&update.uid),
                uid: update.uid,
                state: Some(update.state),
                success: true,
            };
            self.broadcast_result(envelope.tag_key(), MessageKind::Object, &result);
        } else {
            self.reject_object(sender, envelope.tag_key(), MessageKind::Object, update.uid);
        }
    }

    fn handle_spawn(&mut self, sender: ConnectionId, envelope: &Envelope) {
        let Some(update) = decode::<ObjectUpdate>(sender, envelope) else {
            return;
        };
        if self.objects.spawn(&update.uid, sender, update.state.clone()) {
            let result = ObjectResult {
                uid: update.uid,
                lockid: Some(sender),
                state: Some(update.state),
                success: true,
            };
            self.broadcast_result(envelope.tag_key(), MessageKind::Spawn, &result);
        } else {
            self.reject_object(sender, envelope.tag_key(), MessageKind::Spawn, update.uid);
        }
    }

    fn handle_delete(&mut self, sender: ConnectionId, envelope: &Envelope) {
        let Some(update) = decode::<ObjectUpdate>(sender, envelope) else {
            return;
        };
        if self.objects.delete(&update.uid, sender) {
            let result = ObjectResult {
                uid: update.uid,
                lockid: None,
                state: None,
                success: true,
            };
            self.broadcast_result(envelope.tag_key(), MessageKind::Delete, &result);
        } else {
            self.reject_object(sender, envelope.tag_key(), MessageKind::Delete, update.uid);
        }
    }

    fn broadcast_result(&mut self, tag_key: TagKey, kind: MessageKind, result: &ObjectResult) {
        if let Some(text) = encode(tag_key, kind, result) {
            self.registry.broadcast(&text);
        }
    }

    fn reject_object(&mut self, to: ConnectionId, tag_key: TagKey, kind: MessageKind, uid: ObjectId) {
        let result = ObjectResult {
            uid,
            lockid: None,
            state: None,
            success: false,
        };
        if let Some(text) = encode(tag_key, kind, &result) {
            self.registry.send_to(to, Outbound::Text(text));
        }
    }

    fn handle_avatar(&mut self, sender: ConnectionId, envelope: &Envelope) {
        let Some(update) = decode::<AvatarUpdate>(sender, envelope) else {
            return;
        };
        self.avatars.insert(sender, update.state);
    }

    fn avatar_map(&self) -> Map<String, Value> {
        self.avatars
            .iter()
            .map(|(id, state)| (id.to_string(), state.clone()))
            .collect()
    }
}

/// A lock or release that names a requester other than the sender.
fn is_impersonation(sender: ConnectionId, request: &LockRequest) -> bool {
    request
        .claimed_requester()
        .is_some_and(|claimed| claimed != sender)
}

fn encode<T: Serialize>(tag_key: TagKey, kind: MessageKind, payload: &T) -> Option<String> {
    match Envelope::from_payload(tag_key, kind.as_str(), payload) {
        Ok(envelope) => Some(envelope.to_text()),
        Err(e) => {
            warn!(%kind, error = %e, "failed to encode outgoing message");
            None
        }
    }
}

fn decode<T: DeserializeOwned>(sender: ConnectionId, envelope: &Envelope) -> Option<T> {
    match envelope.payload() {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(conn = %sender, error = %e, "dropping invalid payload");
            None
        }
    }
}
