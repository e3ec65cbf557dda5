// Resilient WebSocket client for the relays.
//
// `ConnectionManager` keeps one link to one relay alive. Architecture:
// - `connect()` spawns a driver task on the current tokio runtime and
//   returns immediately. The driver owns the socket. It connects, pumps
//   frames, and on abnormal loss sleeps per `Backoff` and reconnects.
// - Inbound text frames are parsed into `Envelope`s and published on the
//   manager's `EventBus`, keyed by message kind. A frame that fails to parse
//   is logged and skipped; the link stays up.
// - Outbound frames go through an unbounded channel into the driver. The
//   channel only exists while the link is `Open`; `send()` at any other time
//   logs and drops the message (at-most-once delivery, no queuing).
// - Liveness: any inbound traffic (including the relay's pings) resets a
//   `Heartbeat` timer. If it runs out, the link is treated as stalled and
//   the driver reconnects.
// - Close codes: a normal close (1000) from either side ends the driver in
//   `Closed`. Every other close, error or EOF takes the reconnect path.
//
// The state machine is published through a `tokio::sync::watch` channel so
// callers can observe it (`watch_state`) or wait for a state (`wait_for`)
// without blocking anything else.
//
// Plain `ws://` only; the client does not negotiate TLS.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use metaroom_protocol::Envelope;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::error::ClientError;
use crate::event_bus::EventBus;

/// How long `close()` waits for the relay to acknowledge.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type Link = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Anything that can put an envelope on the wire. Implemented by
/// `ConnectionManager`; the lock registry depends only on this.
pub trait EnvelopeSink: Send + Sync {
    fn send_envelope(&self, envelope: &Envelope) -> Result<(), ClientError>;
}

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub heartbeat_interval: Duration,
    pub latency_margin: Duration,
    pub backoff: BackoffConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            latency_margin: Duration::from_secs(1),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Silence longer than this means the link is stalled.
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval + self.latency_margin
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closing,
    Closed,
}

/// Liveness timer reset by inbound traffic.
#[derive(Clone, Copy, Debug)]
pub struct Heartbeat {
    timeout: Duration,
    last_seen: Instant,
}

impl Heartbeat {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Heartbeat {
            timeout,
            last_seen: now,
        }
    }

    pub fn beat(&mut self, now: Instant) {
        self.last_seen = now;
    }

    pub fn deadline(&self) -> Instant {
        self.last_seen + self.timeout
    }

    pub fn is_stalled(&self, now: Instant) -> bool {
        now > self.deadline()
    }
}

/// How one link ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LinkOutcome {
    /// Normal closure; do not reconnect.
    Closed,
    /// Anything else; reconnect.
    Lost,
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    close_requested: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "connection state");
        }
    }

    fn closing(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }

    fn abort_driver(&self) {
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        self.outbound.lock().take();
    }
}

#[derive(Clone)]
pub struct ConnectionManager {
    config: ConnectionConfig,
    bus: EventBus<Envelope>,
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, bus: EventBus<Envelope>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        ConnectionManager {
            config,
            bus,
            shared: Arc::new(Shared {
                state,
                outbound: Mutex::new(None),
                close_requested: AtomicBool::new(false),
                driver: Mutex::new(None),
            }),
        }
    }

    pub fn bus(&self) -> &EventBus<Envelope> {
        &self.bus
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the manager reaches `target`. Returns false on timeout.
    pub async fn wait_for(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.watch_state();
        tokio::time::timeout(timeout, async move {
            rx.wait_for(|state| *state == target).await.is_ok()
        })
        .await
        .unwrap_or(false)
    }

    /// Connect to `ws://host:port`. Must be called inside a tokio runtime.
    pub fn connect(&self, host: &str, port: u16) {
        self.connect_url(format!("ws://{host}:{port}"));
    }

    /// Start (or restart) the driver for `url`.
    pub fn connect_url(&self, url: impl Into<String>) {
        let url = url.into();
        self.shared.abort_driver();
        self.shared.close_requested.store(false, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Connecting);
        let driver = tokio::spawn(drive(
            url,
            self.config.clone(),
            self.bus.clone(),
            Arc::clone(&self.shared),
        ));
        *self.shared.driver.lock() = Some(driver);
    }

    /// Queue an envelope on the open link. Dropped (and logged) otherwise.
    pub fn send(&self, envelope: &Envelope) -> Result<(), ClientError> {
        let state = self.state();
        if state != ConnectionState::Open {
            warn!(kind = envelope.kind(), ?state, "link not open; message dropped");
            return Err(ClientError::NotOpen);
        }
        let outbound = self.shared.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            warn!(kind = envelope.kind(), "link not open; message dropped");
            return Err(ClientError::NotOpen);
        };
        tx.send(Message::Text(envelope.to_text()))
            .map_err(|_| ClientError::NotOpen)
    }

    /// Close the link with a normal Close frame. No reconnect follows.
    pub async fn close(&self) {
        self.shared.close_requested.store(true, Ordering::SeqCst);
        if matches!(self.state(), ConnectionState::Idle | ConnectionState::Closed) {
            self.shared.abort_driver();
            self.shared.set_state(ConnectionState::Closed);
            return;
        }
        self.shared.set_state(ConnectionState::Closing);
        let frame = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "client closing".into(),
        }));
        let queued = self
            .shared
            .outbound
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok());
        if !queued || !self.wait_for(ConnectionState::Closed, CLOSE_TIMEOUT * 2).await {
            self.shared.abort_driver();
            self.shared.set_state(ConnectionState::Closed);
        }
        info!("link closed");
    }

    /// Stop the driver immediately without a closing handshake.
    pub fn abort(&self) {
        self.shared.close_requested.store(true, Ordering::SeqCst);
        self.shared.abort_driver();
        self.shared.set_state(ConnectionState::Closed);
    }
}

impl EnvelopeSink for ConnectionManager {
    fn send_envelope(&self, envelope: &Envelope) -> Result<(), ClientError> {
        self.send(envelope)
    }
}

async fn drive(url: String, config: ConnectionConfig, bus: EventBus<Envelope>, shared: Arc<Shared>) {
    let mut backoff = Backoff::new(config.backoff.clone());
    loop {
        if shared.closing() {
            break;
        }
        shared.set_state(ConnectionState::Connecting);
        let outcome = match connect_async(url.as_str()).await {
            Ok((link, _response)) => {
                backoff.reset();
                info!(%url, "link open");
                run_link(link, &config, &bus, &shared).await
            }
            Err(e) => {
                warn!(%url, error = %e, "connect failed");
                LinkOutcome::Lost
            }
        };
        shared.outbound.lock().take();
        if outcome == LinkOutcome::Closed || shared.closing() {
            break;
        }

        shared.set_state(ConnectionState::Reconnecting);
        let Some(delay) = backoff.next_delay() else {
            error!(%url, attempts = backoff.attempts(), "reconnect attempts exhausted; giving up");
            break;
        };
        info!(
            %url,
            attempt = backoff.attempts(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnecting"
        );
        tokio::time::sleep(delay).await;
    }
    shared.outbound.lock().take();
    shared.set_state(ConnectionState::Closed);
}

async fn run_link(
    link: Link,
    config: &ConnectionConfig,
    bus: &EventBus<Envelope>,
    shared: &Shared,
) -> LinkOutcome {
    let (mut sink, mut stream) = link.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    *shared.outbound.lock() = Some(tx);
    shared.set_state(ConnectionState::Open);

    let mut heartbeat = Heartbeat::new(config.liveness_timeout(), Instant::now());
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(heartbeat.deadline()) => {
                warn!(timeout = ?config.liveness_timeout(), "no traffic from relay; link stalled");
                return LinkOutcome::Lost;
            }
            frame = rx.recv() => match frame {
                Some(Message::Close(frame)) => {
                    let _ = sink.send(Message::Close(frame)).await;
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, drain_until_close(&mut stream)).await;
                    return LinkOutcome::Closed;
                }
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        warn!(error = %e, "send failed");
                        return LinkOutcome::Lost;
                    }
                }
                None => return LinkOutcome::Lost,
            },
            inbound = stream.next() => {
                heartbeat.beat(Instant::now());
                match inbound {
                    Some(Ok(Message::Text(text))) => publish_inbound(bus, &text),
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.as_ref().map(|f| f.code);
                        info!(?code, "relay closed the link");
                        return if code == Some(CloseCode::Normal) {
                            LinkOutcome::Closed
                        } else {
                            LinkOutcome::Lost
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "link error");
                        return LinkOutcome::Lost;
                    }
                    None => return LinkOutcome::Lost,
                }
            }
        }
    }
}

async fn drain_until_close(stream: &mut SplitStream<Link>) {
    while let Some(Ok(message)) = stream.next().await {
        if message.is_close() {
            break;
        }
    }
}

/// Parse one inbound frame and publish it under its kind.
fn publish_inbound(bus: &EventBus<Envelope>, text: &str) {
    match Envelope::parse(text) {
        Ok(envelope) => {
            bus.publish(envelope.kind(), &envelope);
        }
        Err(e) => warn!(error = %e, "dropping malformed frame from relay"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn heartbeat_deadline_moves_with_traffic() {
        let start = Instant::now();
        let mut heartbeat = Heartbeat::new(Duration::from_secs(31), start);
        assert!(!heartbeat.is_stalled(start + Duration::from_secs(30)));
        assert!(heartbeat.is_stalled(start + Duration::from_secs(32)));

        heartbeat.beat(start + Duration::from_secs(20));
        assert_eq!(heartbeat.deadline(), start + Duration::from_secs(51));
        assert!(!heartbeat.is_stalled(start + Duration::from_secs(32)));
    }

    #[test]
    fn liveness_timeout_adds_the_margin() {
        let config = ConnectionConfig::default();
        assert_eq!(config.liveness_timeout(), Duration::from_secs(31));
    }

    #[test]
    fn inbound_frames_are_published_by_kind() {
        let bus: EventBus<Envelope> = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.subscribe("User_State", move |env: &Envelope| {
            assert_eq!(env.get("n"), Some(&serde_json::json!(1)));
            h.fetch_add(1, Ordering::SeqCst);
        });
        publish_inbound(&bus, r#"{"MR_Message":"User_State","n":1}"#);
        publish_inbound(&bus, "not json");
        publish_inbound(&bus, r#"{"type":"tick","time":5}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_before_open_is_dropped() {
        let manager = ConnectionManager::new(ConnectionConfig::default(), EventBus::new());
        let envelope = Envelope::new(metaroom_protocol::TagKey::MrMessage, "User_State");
        assert!(matches!(manager.send(&envelope), Err(ClientError::NotOpen)));
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn failed_connects_back_off_and_give_up() {
        // Bind and immediately drop a listener to get a port nobody serves.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = ConnectionConfig {
            backoff: BackoffConfig {
                base: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
                max_retries: Some(2),
            },
            ..ConnectionConfig::default()
        };
        let manager = ConnectionManager::new(config, EventBus::new());
        let mut states = manager.watch_state();
        manager.connect("127.0.0.1", port);

        let mut saw_reconnecting = false;
        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if *states.borrow_and_update() == ConnectionState::Reconnecting {
                    saw_reconnecting = true;
                }
                if *states.borrow() == ConnectionState::Closed {
                    break;
                }
                if states.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        assert!(finished.is_ok());
        assert!(saw_reconnecting);
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn close_when_idle_is_immediate() {
        let manager = ConnectionManager::new(ConnectionConfig::default(), EventBus::new());
        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Closed);
    }
}
