// Typed message payloads.
//
// Each struct here is the body of one envelope kind (see `envelope.rs`), minus
// the tag field. The relay and clients decode bodies with
// `Envelope::payload::<T>()` and build outgoing frames with
// `Envelope::from_payload`. Field names follow the browser clients' JSON
// exactly, including their camelCase and abbreviations (`uid`, `lockid`).
//
// Caller-defined payloads (`User_State` state, object and avatar state) are
// carried as raw `serde_json::Value`; the relay never looks inside them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{ConnectionId, ObjectId, WorldIndex};

/// `Init`: relay greeting on the front-end link; also accepted as a client
/// request, in which case the relay replies with a fresh greeting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InitPayload {
    pub key: WorldIndex,
    pub uid: ConnectionId,
}

/// `Load_World`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoadWorldPayload {
    pub key: WorldIndex,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub uid: ConnectionId,
}

/// `User_Leave`: front-end departure notice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserLeavePayload {
    pub info: UserInfo,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EchoData {
    #[serde(default)]
    pub message: Value,
}

/// `Echo`: returned verbatim to the sender.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EchoPayload {
    pub data: EchoData,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOptions {
    #[serde(default)]
    pub guard_against_overwrite: bool,
}

/// One entry of a `Write_Files` batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileWrite {
    pub path: String,
    pub text: String,
    #[serde(default)]
    pub opts: WriteOptions,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WriteFilesPayload {
    pub files: Vec<FileWrite>,
}

/// `Watch_Files` / `Unwatch_Files`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileListPayload {
    pub files: Vec<String>,
}

/// `Update_File`: new content of a watched file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateFilePayload {
    pub file: String,
    pub content: String,
}

/// `lock` / `release` request. Browsers send `lockid: -1` before they know
/// their own id, so the requester field is kept as a raw integer; the relay
/// always arbitrates on the sending connection's id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LockRequest {
    pub uid: ObjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lockid: Option<i64>,
}

impl LockRequest {
    pub fn new(uid: ObjectId, requester: ConnectionId) -> Self {
        LockRequest {
            uid,
            lockid: i64::try_from(requester.0).ok(),
        }
    }

    /// The connection the request claims to come from, if it names one.
    pub fn claimed_requester(&self) -> Option<ConnectionId> {
        self.lockid
            .and_then(|id| u64::try_from(id).ok())
            .map(ConnectionId)
    }
}

/// Relay verdict on a `lock` or `release`. On success `lockid` is the owner
/// after the operation; on a rejected lock it names the current owner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LockResult {
    pub uid: ObjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lockid: Option<ConnectionId>,
    pub success: bool,
}

/// `object` / `spawn` / `delete` request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectUpdate {
    pub uid: ObjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lockid: Option<i64>,
    #[serde(default)]
    pub state: Value,
}

/// Relay verdict on an `object`, `spawn` or `delete`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectResult {
    pub uid: ObjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lockid: Option<ConnectionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    pub success: bool,
}

/// `avatar` from a client: its latest pose.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AvatarUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<ConnectionId>,
    pub state: Value,
}

/// `avatar` from the relay: every known pose keyed by connection id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AvatarBroadcast {
    pub data: Map<String, Value>,
}

/// `initialize`: object-sync greeting sent to a newcomer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InitializePayload {
    pub id: ConnectionId,
    pub objects: Map<String, Value>,
    pub avatars: Map<String, Value>,
}

/// `join`: announces a newcomer to everyone else.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub id: ConnectionId,
}

/// `leave`: object-sync departure notice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeavePayload {
    pub user: ConnectionId,
}

/// `tick`: periodic relay clock, milliseconds since the Unix epoch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TickPayload {
    pub time: u64,
}
