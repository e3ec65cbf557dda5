// End-to-end integration tests for the multi-user pipeline.
//
// Each test starts a real relay, connects real `ClientSession`s (via
// `TestClient`) and verifies the full path: client request → relay
// arbitration or fan-out → every client's view.
//
// These tests exercise the same code paths as a live client (connection
// manager, lock registry, identity tracking); the only test-specific code
// is the inbox and polling helpers in `TestClient`.

use std::net::SocketAddr;
use std::time::Duration;

use metaroom_protocol::{ConnectionId, TagKey};
use metaroom_relay::client::ConnectionState;
use metaroom_relay::lock::LockAttempt;
use metaroom_relay::server::{RelayConfig, RelayHandle, start_relay};
use metaroom_relay::session::RelayRole;
use multiplayer_tests::{TestClient, wait_until};
use serde_json::json;

fn test_config(role: RelayRole) -> RelayConfig {
    RelayConfig {
        port: 0,
        role,
        broadcast_interval: Duration::from_secs(3600),
        watch_files: false,
        ..RelayConfig::default()
    }
}

async fn start(role: RelayRole) -> (RelayHandle, SocketAddr) {
    start_relay(test_config(role)).await.unwrap()
}

#[tokio::test]
async fn lock_contention_has_exactly_one_winner() {
    let (handle, addr) = start(RelayRole::ObjectSync).await;
    let a = TestClient::connect(addr, TagKey::Type).await;
    let b = TestClient::connect(addr, TagKey::Type).await;

    let lock_a = a.lock_for(5);
    let lock_b = b.lock_for(5);
    assert_eq!(lock_a.lock().unwrap(), LockAttempt::Pending);
    assert_eq!(lock_b.lock().unwrap(), LockAttempt::Pending);

    wait_until("both verdicts", || !lock_a.pending() && !lock_b.pending()).await;
    assert!(lock_a.locked() ^ lock_b.locked(), "exactly one client must win");

    let winner = if lock_a.locked() { a.id() } else { b.id() };
    assert_eq!(lock_a.owner(), Some(winner));
    assert_eq!(lock_b.owner(), Some(winner));
    assert!(!lock_a.available());

    handle.stop().await;
}

#[tokio::test]
async fn unlock_frees_the_object_for_others() {
    let (handle, addr) = start(RelayRole::ObjectSync).await;
    let a = TestClient::connect(addr, TagKey::Type).await;
    let b = TestClient::connect(addr, TagKey::Type).await;

    let lock_a = a.lock_for(9);
    lock_a.lock().unwrap();
    wait_until("a holds the lock", || lock_a.locked()).await;
    let lock_b = b.lock_for(9);
    wait_until("b sees a as owner", || lock_b.owner() == Some(a.id())).await;
    assert_eq!(lock_b.lock().unwrap(), LockAttempt::Unavailable);

    assert!(lock_a.unlock().unwrap());
    wait_until("b sees the release", || lock_b.available()).await;
    assert_eq!(lock_b.lock().unwrap(), LockAttempt::Pending);
    wait_until("b holds the lock", || lock_b.locked()).await;

    handle.stop().await;
}

#[tokio::test]
async fn disconnect_releases_locks() {
    let (handle, addr) = start(RelayRole::ObjectSync).await;
    let a = TestClient::connect(addr, TagKey::Type).await;
    let mut b = TestClient::connect(addr, TagKey::Type).await;
    let a_id = a.id();

    let lock_a = a.lock_for(3);
    lock_a.lock().unwrap();
    let lock_b = b.lock_for(3);
    wait_until("b sees a as owner", || lock_b.owner() == Some(a_id)).await;

    a.close().await;
    let release = b.recv_kind("release").await;
    assert_eq!(release.get("success"), Some(&json!(true)));
    let leave = b.recv_kind("leave").await;
    assert_eq!(leave.get("user"), Some(&json!(a_id.0)));
    assert!(lock_b.available());

    handle.stop().await;
}

#[tokio::test]
async fn user_state_reaches_the_other_clients_only() {
    let (handle, addr) = start(RelayRole::FrontEnd).await;
    let mut a = TestClient::connect(addr, TagKey::MrMessage).await;
    let mut b = TestClient::connect(addr, TagKey::MrMessage).await;
    let mut c = TestClient::connect(addr, TagKey::MrMessage).await;

    a.send_json(json!({"MR_Message": "User_State", "pos": [0, 1, 2]}));
    for peer in [&mut b, &mut c] {
        let state = peer.recv_kind("User_State").await;
        assert_eq!(state.get("pos"), Some(&json!([0, 1, 2])));
    }
    assert!(a.silent_for("User_State", Duration::from_millis(200)).await);

    handle.stop().await;
}

#[tokio::test]
async fn front_end_identity_comes_from_init() {
    let (handle, addr) = start(RelayRole::FrontEnd).await;
    let a = TestClient::connect(addr, TagKey::MrMessage).await;
    let b = TestClient::connect(addr, TagKey::MrMessage).await;
    assert_eq!(a.id(), ConnectionId(0));
    assert_eq!(b.id(), ConnectionId(1));
    handle.stop().await;
}

#[tokio::test]
async fn client_reconnects_after_relay_restart() {
    let (handle, addr) = start(RelayRole::FrontEnd).await;
    let mut a = TestClient::connect(addr, TagKey::MrMessage).await;
    a.recv_kind("Init").await;

    // Going-away close: the client must not treat it as final.
    handle.stop().await;
    a.wait_for_state(ConnectionState::Reconnecting).await;

    let (handle, _) = start_relay(RelayConfig {
        port: addr.port(),
        ..test_config(RelayRole::FrontEnd)
    })
    .await
    .unwrap();
    let greeting = a.recv_kind("Init").await;
    assert_eq!(greeting.get("uid"), Some(&json!(0)));
    a.wait_for_state(ConnectionState::Open).await;

    a.send_json(json!({"MR_Message": "Echo", "data": {"message": "back"}}));
    let echo = a.recv_kind("Echo").await;
    assert_eq!(echo.get("data"), Some(&json!({"message": "back"})));

    a.close().await;
    handle.stop().await;
}

#[tokio::test]
async fn client_close_is_final() {
    let (handle, addr) = start(RelayRole::FrontEnd).await;
    let a = TestClient::connect(addr, TagKey::MrMessage).await;
    let session_state = a.session().connection().clone();
    a.close().await;
    assert_eq!(session_state.state(), ConnectionState::Closed);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session_state.state(), ConnectionState::Closed);
    handle.stop().await;
}
