// metaroom_relay — multi-user sync relays and their resilient client.
//
// The relay is a thin message broker for shared WebXR rooms: it accepts
// WebSocket connections, assigns each an id, forwards state updates between
// clients, arbitrates exclusive locks on shared objects, and pushes content
// files to clients when they change on disk. It never renders or simulates
// anything; all world logic stays on the clients.
//
// Module overview:
// - `session.rs`:   Session state: connection roster, lock table, avatar
//                   poses, world pointer, message dispatch. The core data
//                   structure that `server.rs` drives.
// - `server.rs`:    WebSocket listener (optional TLS), one task per
//                   connection, and the single relay loop that owns the
//                   `Session`. Heartbeat sweep and periodic broadcasts.
// - `registry.rs`:  `ConnectionRegistry`: ids, liveness timestamps and the
//                   outbound queue of each connection.
// - `locks.rs`:     `LockTable`: authoritative lock arbiter and shared
//                   object store.
// - `files.rs`:     `FileBridge`: content writes and watch management.
// - `watcher.rs`:   `FileWatcher`: `notify` events republished on an
//                   `EventBus`.
// - `tls.rs`:       PEM loading and the `TlsAcceptor`.
// - `event_bus.rs`: `EventBus`: named-channel publish/subscribe.
// - `client.rs`:    `ConnectionManager`: reconnecting WebSocket client with
//                   heartbeat liveness.
// - `backoff.rs`:   Exponential reconnect backoff.
// - `lock.rs`:      `LockRegistry` / `Lock`: client-side lock cache.
// - `context.rs`:   `ClientSession`: one link, its bus, its locks and its
//                   relay-assigned id.
// - `error.rs`:     Error enums for each layer.
//
// Dependencies: `metaroom_protocol` (envelopes and payloads shared with
// clients).
//
// The relay can run as a standalone binary (`main.rs`) or be embedded in
// another process via the library API (`start_relay`).

pub mod backoff;
pub mod client;
pub mod context;
pub mod error;
pub mod event_bus;
pub mod files;
pub mod lock;
pub mod locks;
pub mod registry;
pub mod server;
pub mod session;
pub mod tls;
pub mod watcher;

pub use client::{ConnectionConfig, ConnectionManager, ConnectionState};
pub use context::ClientSession;
pub use error::{ClientError, FileBridgeError, RelayError};
pub use server::{RelayConfig, RelayHandle, start_relay};
pub use session::RelayRole;
