// metaroom_protocol — wire protocol for the MetaRoom sync relays.
//
// This crate defines the envelope format and message payloads exchanged
// between the relays (`metaroom_relay::server`) and their clients
// (`metaroom_relay::client`). It is shared by both sides and knows nothing
// about sockets or runtimes.
//
// Module overview:
// - `types.rs`:    Core ID types: `ConnectionId`, `ObjectId`, `WorldIndex`.
// - `envelope.rs`: `Envelope` (a tagged JSON object), the two tag dialects
//                  (`MR_Message` and `type`), `MessageKind`, `ProtocolError`.
// - `message.rs`:  Typed payload structs for every message kind.
//
// Design decisions:
// - **JSON text frames.** The browser clients speak JSON over WebSocket text
//   frames, so there is no binary framing layer; the WebSocket codec owns
//   message boundaries.
// - **Untyped bodies with typed views.** Envelopes keep their body as a JSON
//   map so the relay can forward caller-defined payloads untouched, and
//   decode a typed struct only when it needs to act on the contents.

pub mod envelope;
pub mod message;
pub mod types;

pub use envelope::{Envelope, MR_MESSAGE_KEY, MessageKind, ProtocolError, TYPE_KEY, TagKey};
pub use message::{
    AvatarBroadcast, AvatarUpdate, EchoData, EchoPayload, FileListPayload, FileWrite,
    InitPayload, InitializePayload, JoinPayload, LeavePayload, LoadWorldPayload, LockRequest,
    LockResult, ObjectResult, ObjectUpdate, TickPayload, UpdateFilePayload, UserInfo,
    UserLeavePayload, WriteFilesPayload, WriteOptions,
};
pub use types::{ConnectionId, ObjectId, WorldIndex};
