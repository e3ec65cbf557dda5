// Connection registry for the relay.
//
// The registry is the only owner of the relay's id → connection map. It is
// held by `Session` and mutated only from the server's single control loop,
// so it needs no internal locking. Each entry carries the sending half of
// that connection's outbound queue; the per-connection writer task in
// `server.rs` drains the queue in order, which is what gives every
// connection in-order delivery.
//
// Ids come from a monotonically increasing counter and are never reused for
// the lifetime of the process, even after the connection is gone.
//
// A send to a connection whose writer has gone away marks it `Closing`; the
// server's reader task for that socket reports the disconnect shortly after
// and the session then deregisters it.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use metaroom_protocol::ConnectionId;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// One frame queued for a connection's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

pub struct Connection {
    pub id: ConnectionId,
    pub last_heartbeat_at: Instant,
    pub state: ConnectionState,
    outbound: UnboundedSender<Outbound>,
}

impl Connection {
    fn push(&mut self, frame: Outbound) -> bool {
        if self.state != ConnectionState::Open {
            return false;
        }
        if self.outbound.send(frame).is_err() {
            debug!(conn = %self.id, "writer gone; marking connection closing");
            self.state = ConnectionState::Closing;
            return false;
        }
        true
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: BTreeMap<ConnectionId, Connection>,
    next_id: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh id and register the connection as open.
    pub fn register(&mut self, outbound: UnboundedSender<Outbound>, now: Instant) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.connections.insert(
            id,
            Connection {
                id,
                last_heartbeat_at: now,
                state: ConnectionState::Open,
                outbound,
            },
        );
        id
    }

    /// Remove a connection. Returns it (now `Closed`) if it was present.
    pub fn deregister(&mut self, id: ConnectionId) -> Option<Connection> {
        let mut conn = self.connections.remove(&id)?;
        conn.state = ConnectionState::Closed;
        Some(conn)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    /// Record liveness for a connection.
    pub fn touch(&mut self, id: ConnectionId, now: Instant) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.last_heartbeat_at = now;
        }
    }

    /// Connections silent for longer than `timeout`.
    pub fn stale(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|conn| now.saturating_duration_since(conn.last_heartbeat_at) > timeout)
            .map(|conn| conn.id)
            .collect()
    }

    /// Queue a frame for one connection. Returns false if it was not
    /// delivered to the writer.
    pub fn send_to(&mut self, id: ConnectionId, frame: Outbound) -> bool {
        match self.connections.get_mut(&id) {
            Some(conn) => conn.push(frame),
            None => false,
        }
    }

    /// Queue text for every open connection. Returns the delivery count.
    pub fn broadcast(&mut self, text: &str) -> usize {
        let mut delivered = 0;
        for conn in self.connections.values_mut() {
            if conn.push(Outbound::Text(text.to_string())) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Queue text for every open connection except `sender`.
    pub fn broadcast_except(&mut self, sender: ConnectionId, text: &str) -> usize {
        let mut delivered = 0;
        for conn in self.connections.values_mut() {
            if conn.id != sender && conn.push(Outbound::Text(text.to_string())) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Queue a ping for every open connection.
    pub fn ping_all(&mut self) {
        for conn in self.connections.values_mut() {
            conn.push(Outbound::Ping);
        }
    }

    /// Queue a Close frame and mark the connection closing. Later sends to
    /// it are dropped.
    pub fn close(&mut self, id: ConnectionId, code: u16, reason: &str) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.push(Outbound::Close {
                code,
                reason: reason.to_string(),
            });
            conn.state = ConnectionState::Closing;
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::*;

    fn open(registry: &mut ConnectionRegistry) -> (ConnectionId, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (registry.register(tx, Instant::now()), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let mut registry = ConnectionRegistry::new();
        let (a, _ra) = open(&mut registry);
        let (b, _rb) = open(&mut registry);
        assert!(registry.deregister(a).is_some());
        let (c, _rc) = open(&mut registry);
        assert_eq!((a, b, c), (ConnectionId(0), ConnectionId(1), ConnectionId(2)));
    }

    #[test]
    fn deregister_twice_is_harmless() {
        let mut registry = ConnectionRegistry::new();
        let (a, _ra) = open(&mut registry);
        let conn = registry.deregister(a).unwrap();
        assert_eq!(conn.state, ConnectionState::Closed);
        assert!(registry.deregister(a).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn broadcast_except_skips_the_sender() {
        let mut registry = ConnectionRegistry::new();
        let (a, mut ra) = open(&mut registry);
        let (_b, mut rb) = open(&mut registry);
        let (_c, mut rc) = open(&mut registry);

        assert_eq!(registry.broadcast_except(a, "hi"), 2);
        assert!(drain(&mut ra).is_empty());
        assert_eq!(drain(&mut rb), vec![Outbound::Text("hi".into())]);
        assert_eq!(drain(&mut rc), vec![Outbound::Text("hi".into())]);

        assert_eq!(registry.broadcast("all"), 3);
        assert_eq!(drain(&mut ra), vec![Outbound::Text("all".into())]);
    }

    #[test]
    fn dead_writer_is_marked_closing() {
        let mut registry = ConnectionRegistry::new();
        let (a, ra) = open(&mut registry);
        let (_b, mut rb) = open(&mut registry);
        drop(ra);

        assert_eq!(registry.broadcast("x"), 1);
        assert!(!registry.send_to(a, Outbound::Ping));
        assert_eq!(drain(&mut rb).len(), 1);
        // Still registered until the reader reports the disconnect.
        assert!(registry.contains(a));
        assert_eq!(registry.broadcast("y"), 1);
        let closed = registry.deregister(a).unwrap();
        assert_eq!(closed.state, ConnectionState::Closed);
    }

    #[test]
    fn close_drops_later_frames() {
        let mut registry = ConnectionRegistry::new();
        let (a, mut ra) = open(&mut registry);
        registry.close(a, 1000, "bye");
        assert!(!registry.send_to(a, Outbound::Text("late".into())));
        assert_eq!(
            drain(&mut ra),
            vec![Outbound::Close {
                code: 1000,
                reason: "bye".into()
            }]
        );
    }

    #[test]
    fn stale_uses_last_heartbeat() {
        let mut registry = ConnectionRegistry::new();
        let start = Instant::now();
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = registry.register(tx, start);
        let (tx, _rx2) = mpsc::unbounded_channel();
        let b = registry.register(tx, start);

        registry.touch(b, start + Duration::from_secs(20));
        let stale = registry.stale(start + Duration::from_secs(31), Duration::from_secs(30));
        assert_eq!(stale, vec![a]);
        assert!(!stale.contains(&b));
    }
}
