// Test-only client for multi-user integration tests.
//
// Wraps a real `ClientSession` (from `metaroom_relay::context`) to provide a
// test-friendly API for exercising the full pipeline:
// client → relay → arbitration / fan-out → other clients' caches.
//
// The only test-specific code here is the inbox (every envelope the session
// publishes is also copied into a channel the test can await) and the
// polling helpers with timeouts. All networking, reconnect and lock logic
// uses the same code paths as a real client.
//
// See also: `tests/full_pipeline.rs` for the integration test scenarios.

use std::net::SocketAddr;
use std::time::Duration;

use metaroom_protocol::{ConnectionId, Envelope, MessageKind, TagKey};
use metaroom_relay::backoff::BackoffConfig;
use metaroom_relay::client::{ConnectionConfig, ConnectionState};
use metaroom_relay::context::ClientSession;
use metaroom_relay::lock::Lock;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// Default timeout for waiting operations.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Every kind the relays send, so the inbox sees all traffic.
const INBOX_KINDS: [MessageKind; 19] = [
    MessageKind::Init,
    MessageKind::LoadWorld,
    MessageKind::UserState,
    MessageKind::UserLeave,
    MessageKind::Echo,
    MessageKind::WriteFiles,
    MessageKind::WatchFiles,
    MessageKind::UnwatchFiles,
    MessageKind::UpdateFile,
    MessageKind::Lock,
    MessageKind::Release,
    MessageKind::Initialize,
    MessageKind::Join,
    MessageKind::Leave,
    MessageKind::Tick,
    MessageKind::Avatar,
    MessageKind::Object,
    MessageKind::Spawn,
    MessageKind::Delete,
];

/// Connection settings tuned for tests: quick reconnects.
pub fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        backoff: BackoffConfig {
            base: Duration::from_millis(20),
            max_delay: Duration::from_millis(200),
            max_retries: None,
        },
        ..ConnectionConfig::default()
    }
}

/// A test client wrapping a real `ClientSession`.
pub struct TestClient {
    session: ClientSession,
    inbox: UnboundedReceiver<Envelope>,
}

impl TestClient {
    /// Connect and wait until the relay has greeted us with an id.
    pub async fn connect(addr: SocketAddr, dialect: TagKey) -> Self {
        let client = Self::new(dialect);
        client.session.connect_url(format!("ws://{addr}"));
        client
            .session
            .wait_for_identity(WAIT_TIMEOUT)
            .await
            .expect("relay never assigned an id");
        client
    }

    fn new(dialect: TagKey) -> Self {
        let session = ClientSession::with_dialect(fast_config(), dialect);
        let (tx, inbox) = mpsc::unbounded_channel();
        for kind in INBOX_KINDS {
            let tx = tx.clone();
            session
                .bus()
                .subscribe(kind.as_str(), move |envelope: &Envelope| {
                    let _ = tx.send(envelope.clone());
                });
        }
        Self { session, inbox }
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    pub fn id(&self) -> ConnectionId {
        self.session.self_id().expect("no id assigned")
    }

    pub fn state(&self) -> ConnectionState {
        self.session.connection().state()
    }

    pub fn lock_for(&self, object: i64) -> Lock {
        self.session.lock_for(object)
    }

    /// Send a JSON frame (tag included) on the open link.
    pub fn send_json(&self, frame: Value) {
        let envelope = Envelope::parse(&frame.to_string()).expect("test frame must be an envelope");
        self.session.send(&envelope).expect("send failed");
    }

    /// Next inbound envelope of `kind`, skipping others.
    pub async fn recv_kind(&mut self, kind: &str) -> Envelope {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            loop {
                let envelope = self.inbox.recv().await.expect("inbox closed");
                if envelope.kind() == kind {
                    return envelope;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no `{kind}` within {WAIT_TIMEOUT:?}"))
    }

    /// True if no envelope of `kind` arrives within `wait`.
    pub async fn silent_for(&mut self, kind: &str, wait: Duration) -> bool {
        let found = tokio::time::timeout(wait, async {
            while let Some(envelope) = self.inbox.recv().await {
                if envelope.kind() == kind {
                    return;
                }
            }
            std::future::pending::<()>().await;
        })
        .await;
        found.is_err()
    }

    pub async fn wait_for_state(&self, target: ConnectionState) {
        assert!(
            self.session
                .connection()
                .wait_for(target, WAIT_TIMEOUT)
                .await,
            "never reached {target:?}; stuck in {:?}",
            self.state()
        );
    }

    pub async fn close(self) {
        self.session.close().await;
    }
}

/// Poll `condition` until it holds or `WAIT_TIMEOUT` passes.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
