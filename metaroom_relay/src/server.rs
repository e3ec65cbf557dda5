// WebSocket listener and main event loop for a relay.
//
// Architecture: task-per-connection with a central `mpsc` channel.
//
// - **Accept task** (`accept_loop`): accepts TCP connections and spawns one
//   connection task each. Stops accepting when the shutdown flag flips.
// - **Connection tasks** (`handle_connection` → `pump`): optional TLS, then
//   the WebSocket handshake, then a `select!` over the socket and the
//   connection's outbound queue. The task registers itself with the loop
//   (`InternalEvent::Opened`, answered with the assigned id over a oneshot),
//   forwards every inbound text frame as `MessageFrom`, and reports pings and
//   pongs as `Alive`. On close, error or EOF it sends `Disconnected`.
// - **Relay loop** (`run_relay`): owns the `Session`, receives events from
//   the channel and dispatches them. Two timers share the loop: the broadcast
//   interval (periodic traffic) and the heartbeat sweep (ping everyone, close
//   anyone silent past `heartbeat_interval + latency_margin`).
//
// The relay loop is the only writer of session state. Connection tasks are
// the only writers of their socket: the session queues `Outbound` frames and
// the task drains them in order.
//
// Every loop step (event dispatch, periodic broadcast, sweep) runs under
// `guarded`, so a panic is logged and the loop keeps serving. A panic while
// handling one frame also closes the offending connection with 1011 and
// cleans it up like any other close.
//
// Shutdown: `RelayHandle::stop` flips a `watch` flag. The accept task exits,
// the loop queues a 1001 Close to every connection and exits, and `stop`
// waits (bounded) for the connection tasks to flush and finish. Each
// connection task holds a clone of a drain sender; the drain receiver
// returns `None` once all of them are gone.

use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use metaroom_protocol::ConnectionId;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::files::FileBridge;
use crate::registry::Outbound;
use crate::session::{CLOSE_INTERNAL_ERROR, RelayRole, Session};
use crate::tls::{self, TlsConfig};
use crate::watcher::{CHANGE_CHANNEL, FileEvent, FileWatcher};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Events sent from the accept and connection tasks to the relay loop.
enum InternalEvent {
    Opened {
        outbound: UnboundedSender<Outbound>,
        reply: oneshot::Sender<ConnectionId>,
    },
    MessageFrom {
        conn: ConnectionId,
        text: String,
    },
    Alive {
        conn: ConnectionId,
    },
    Disconnected {
        conn: ConnectionId,
    },
    FileChanged {
        path: PathBuf,
    },
}

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    shutdown: watch::Sender<bool>,
    accept: Option<JoinHandle<()>>,
    relay: Option<JoinHandle<()>>,
    drained: mpsc::Receiver<()>,
}

impl RelayHandle {
    /// Close every connection with 1001 and wait for the relay to shut down.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(accept) = self.accept.take() {
            let _ = accept.await;
        }
        let finished = match self.relay.take() {
            Some(relay) => relay.await,
            None => Ok(()),
        };
        if let Err(e) = finished {
            error!(error = %e, "relay loop ended abnormally");
        }
        if tokio::time::timeout(DRAIN_TIMEOUT, self.drained.recv())
            .await
            .is_err()
        {
            warn!("connection tasks still running after shutdown timeout");
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Configuration for starting a relay server.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub role: RelayRole,
    pub broadcast_interval: Duration,
    pub heartbeat_interval: Duration,
    pub latency_margin: Duration,
    pub content_root: PathBuf,
    pub watch_files: bool,
    pub tls: Option<TlsConfig>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            role: RelayRole::FrontEnd,
            broadcast_interval: Duration::from_millis(3000),
            heartbeat_interval: Duration::from_secs(30),
            latency_margin: Duration::from_secs(1),
            content_root: PathBuf::from("."),
            watch_files: true,
            tls: None,
        }
    }
}

impl RelayConfig {
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval + self.latency_margin
    }
}

/// Start the relay on the current tokio runtime. Returns a handle for
/// stopping it and the actual bound address (useful when port 0 is used
/// to let the OS pick a free port).
pub async fn start_relay(config: RelayConfig) -> Result<(RelayHandle, SocketAddr), RelayError> {
    let tls = config.tls.as_ref().map(tls::acceptor).transpose()?;
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let files = file_bridge(&config, &events_tx)?;
    let session = Session::new(config.role, files);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (drain_tx, drained) = mpsc::channel(1);

    info!(
        %addr,
        role = ?config.role,
        tls = tls.is_some(),
        watch_files = config.watch_files,
        "relay listening"
    );

    let accept = tokio::spawn(accept_loop(
        listener,
        tls,
        events_tx,
        shutdown_rx.clone(),
        drain_tx,
    ));
    let relay = tokio::spawn(run_relay(session, events_rx, shutdown_rx, config));

    Ok((
        RelayHandle {
            shutdown: shutdown_tx,
            accept: Some(accept),
            relay: Some(relay),
            drained,
        },
        addr,
    ))
}

/// Build the filesystem bridge, wiring watcher `change` events into the
/// relay loop.
fn file_bridge(
    config: &RelayConfig,
    events: &UnboundedSender<InternalEvent>,
) -> Result<FileBridge, RelayError> {
    if !config.watch_files {
        return Ok(FileBridge::new(&config.content_root));
    }
    let watcher = FileWatcher::new()?;
    let events = events.clone();
    watcher
        .events()
        .subscribe(CHANGE_CHANNEL, move |event: &FileEvent| {
            let _ = events.send(InternalEvent::FileChanged {
                path: event.path().to_path_buf(),
            });
        });
    Ok(FileBridge::with_watcher(&config.content_root, watcher))
}

async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    events: UnboundedSender<InternalEvent>,
    mut shutdown: watch::Receiver<bool>,
    drain: mpsc::Sender<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted TCP connection");
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(handle_connection(
                        stream,
                        peer,
                        tls.clone(),
                        events.clone(),
                        drain.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
    debug!("accept loop stopped");
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    events: UnboundedSender<InternalEvent>,
    _drain: mpsc::Sender<()>,
) {
    match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => serve(stream, peer, events).await,
            Err(e) => warn!(%peer, error = %e, "TLS handshake failed"),
        },
        None => serve(stream, peer, events).await,
    }
}

async fn serve<S>(stream: S, peer: SocketAddr, events: UnboundedSender<InternalEvent>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ws = match tokio::time::timeout(HANDSHAKE_TIMEOUT, accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            warn!(%peer, error = %e, "WebSocket handshake failed");
            return;
        }
        Err(_) => {
            warn!(%peer, "WebSocket handshake timed out");
            return;
        }
    };
    pump(ws, peer, events).await;
}

/// Register with the relay loop, then shuttle frames both ways until either
/// side ends the connection.
async fn pump<S>(ws: WebSocketStream<S>, peer: SocketAddr, events: UnboundedSender<InternalEvent>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (outbound, mut queue) = mpsc::unbounded_channel();
    let (reply, assigned) = oneshot::channel();
    if events.send(InternalEvent::Opened { outbound, reply }).is_err() {
        return;
    }
    let Ok(conn) = assigned.await else {
        return;
    };
    debug!(conn = %conn, %peer, "connection open");

    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            frame = queue.recv() => match frame {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        debug!(conn = %conn, error = %e, "write failed");
                        break;
                    }
                }
                Some(Outbound::Ping) => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
                // Deregistered by the relay loop.
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(InternalEvent::MessageFrom { conn, text });
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        let _ = events.send(InternalEvent::MessageFrom { conn, text });
                    }
                    Err(_) => warn!(conn = %conn, "dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    let _ = events.send(InternalEvent::Alive { conn });
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(conn = %conn, code = ?frame.map(|f| f.code), "peer closed");
                    break;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    debug!(conn = %conn, error = %e, "read failed");
                    break;
                }
                None => break,
            },
        }
    }
    let _ = events.send(InternalEvent::Disconnected { conn });
}

/// Main relay loop. Runs until the shutdown flag flips.
async fn run_relay(
    mut session: Session,
    mut events: UnboundedReceiver<InternalEvent>,
    mut shutdown: watch::Receiver<bool>,
    config: RelayConfig,
) {
    let mut broadcast = tokio::time::interval(nonzero(config.broadcast_interval));
    broadcast.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sweep = tokio::time::interval(nonzero(config.heartbeat_interval));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let liveness = config.liveness_timeout();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(event) => handle_event(&mut session, event),
                None => break,
            },
            _ = broadcast.tick() => {
                guarded("periodic broadcast", || session.periodic_broadcast(now_millis()));
            }
            _ = sweep.tick() => {
                guarded("heartbeat sweep", || {
                    session.ping_all();
                    session.reap_stale(Instant::now(), liveness);
                });
            }
        }
    }

    info!(connections = session.connection_count(), "relay shutting down");
    session.close_all();
}

/// Run one loop step, catching a panic. Returns false if it panicked.
fn guarded(step: &str, f: impl FnOnce()) -> bool {
    let finished = catch_unwind(AssertUnwindSafe(f)).is_ok();
    if !finished {
        error!(step, "relay loop step panicked");
    }
    finished
}

/// Dispatch a single event to the session.
fn handle_event(session: &mut Session, event: InternalEvent) {
    match event {
        InternalEvent::Opened { outbound, reply } => {
            // On panic `reply` is dropped and the connection task gives up.
            guarded("connection open", || {
                let conn = session.add_connection(outbound, Instant::now());
                if reply.send(conn).is_err() {
                    session.remove_connection(conn);
                }
            });
        }
        InternalEvent::MessageFrom { conn, text } => {
            if !guarded("message", || session.handle_text(conn, &text, Instant::now())) {
                warn!(conn = %conn, "closing connection after handler panic");
                guarded("panic cleanup", || {
                    session.close_connection(conn, CLOSE_INTERNAL_ERROR, "internal error");
                });
            }
        }
        InternalEvent::Alive { conn } => {
            guarded("touch", || session.touch(conn, Instant::now()));
        }
        InternalEvent::Disconnected { conn } => {
            guarded("disconnect", || session.remove_connection(conn));
        }
        InternalEvent::FileChanged { path } => {
            guarded("file change", || session.file_changed(&path));
        }
    }
}

fn nonzero(interval: Duration) -> Duration {
    interval.max(Duration::from_millis(1))
}

fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_cli() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.broadcast_interval, Duration::from_millis(3000));
        assert_eq!(config.liveness_timeout(), Duration::from_secs(31));
        assert!(config.tls.is_none());
    }

    #[test]
    fn zero_intervals_are_clamped() {
        assert_eq!(nonzero(Duration::ZERO), Duration::from_millis(1));
        assert_eq!(nonzero(Duration::from_secs(2)), Duration::from_secs(2));
    }

    #[test]
    fn guarded_steps_survive_panics() {
        let mut ran = false;
        assert!(guarded("ok", || ran = true));
        assert!(ran);
        assert!(!guarded("boom", || panic!("boom")));
    }

    #[test]
    fn open_event_replies_with_the_assigned_id() {
        let mut session = Session::new(RelayRole::FrontEnd, FileBridge::new(std::env::temp_dir()));
        let (outbound, mut frames) = mpsc::unbounded_channel();
        let (reply, mut assigned) = oneshot::channel();
        handle_event(&mut session, InternalEvent::Opened { outbound, reply });
        assert_eq!(assigned.try_recv().unwrap(), ConnectionId(0));
        assert!(matches!(frames.try_recv(), Ok(Outbound::Text(_))));

        // A closed reply channel undoes the registration.
        let (outbound, _frames) = mpsc::unbounded_channel();
        let (reply, assigned) = oneshot::channel::<ConnectionId>();
        drop(assigned);
        handle_event(&mut session, InternalEvent::Opened { outbound, reply });
        assert_eq!(session.connection_count(), 1);
    }

    #[tokio::test]
    async fn start_and_stop_on_ephemeral_port() {
        let config = RelayConfig {
            port: 0,
            watch_files: false,
            ..RelayConfig::default()
        };
        let (handle, addr) = start_relay(config).await.unwrap();
        assert_ne!(addr.port(), 0);
        handle.stop().await;
    }

    #[tokio::test]
    async fn missing_tls_files_fail_startup() {
        let config = RelayConfig {
            port: 0,
            watch_files: false,
            tls: Some(TlsConfig {
                cert_path: "/nonexistent/cert.pem".into(),
                key_path: "/nonexistent/key.pem".into(),
            }),
            ..RelayConfig::default()
        };
        assert!(matches!(start_relay(config).await, Err(RelayError::Tls(_))));
    }
}
