#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::MockServer;
use tokio::time::timeout;
use ws_transport::ws::config::ConnectionConfig;
use ws_transport::ws::connection::Connection;
use ws_transport::ws::state::ConnectionState;
use ws_transport::ws::time::SystemClock;

fn config(url: &str) -> ConnectionConfig {
    let mut cfg = ConnectionConfig::new(url);
    cfg.dial_timeout = Duration::from_millis(200);
    cfg.reconnect.initial_delay = Duration::from_millis(10);
    cfg.reconnect.max_delay = Duration::from_millis(50);
    cfg
}

async fn wait_for(rx: &mut tokio::sync::watch::Receiver<ConnectionState>, target: ConnectionState) {
    while *rx.borrow() != target {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

#[tokio::test]
async fn connects_and_receives_broadcast_frames() {
    let server = MockServer::start().await;
    let conn = Connection::new(config(&server.ws_url()), Arc::new(SystemClock)).unwrap();
    let mut state_rx = conn.state_receiver();
    wait_for(&mut state_rx, ConnectionState::Connected).await;

    let mut incoming = conn.subscribe();
    server.send(r#"{"type":"ping"}"#);

    let frame = timeout(Duration::from_secs(2), incoming.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame, br#"{"type":"ping"}"#);

    conn.close();
}

#[tokio::test]
async fn send_delivers_frame_to_server() {
    let mut server = MockServer::start().await;
    let conn = Connection::new(config(&server.ws_url()), Arc::new(SystemClock)).unwrap();
    let mut state_rx = conn.state_receiver();
    wait_for(&mut state_rx, ConnectionState::Connected).await;

    conn.send(b"hello".to_vec()).unwrap();
    let received = server.recv_inbound().await.unwrap();
    assert_eq!(received, "hello");

    conn.close();
}

#[tokio::test]
async fn disconnect_then_connect_establishes_a_new_session() {
    let server = MockServer::start().await;
    let conn = Connection::new(config(&server.ws_url()), Arc::new(SystemClock)).unwrap();
    let mut state_rx = conn.state_receiver();
    wait_for(&mut state_rx, ConnectionState::Connected).await;

    conn.disconnect();
    wait_for(&mut state_rx, ConnectionState::Disconnected).await;
    assert!(conn.send(b"nope".to_vec()).is_err());

    conn.connect().unwrap();
    wait_for(&mut state_rx, ConnectionState::Connected).await;
    assert!(conn.send(b"again".to_vec()).is_ok());

    conn.close();
}

#[tokio::test]
async fn reconnects_after_server_drops_the_socket() {
    let server = MockServer::start().await;
    let conn = Connection::new(config(&server.ws_url()), Arc::new(SystemClock)).unwrap();
    let mut state_rx = conn.state_receiver();
    wait_for(&mut state_rx, ConnectionState::Connected).await;

    server.disconnect_all();
    wait_for(&mut state_rx, ConnectionState::Reconnecting).await;
    server.allow_reconnect();
    wait_for(&mut state_rx, ConnectionState::Connected).await;

    conn.close();
}

#[tokio::test]
async fn close_is_terminal_and_rejects_reconnection() {
    let server = MockServer::start().await;
    let conn = Connection::new(config(&server.ws_url()), Arc::new(SystemClock)).unwrap();
    let mut state_rx = conn.state_receiver();
    wait_for(&mut state_rx, ConnectionState::Connected).await;

    conn.close();
    wait_for(&mut state_rx, ConnectionState::Closed).await;
    assert!(conn.connect().is_err());
    assert!(conn.send(b"x".to_vec()).is_err());
}
