#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::MockServer;
use ws_transport::ws::config::ConnectionConfig;
use ws_transport::ws::connection::Connection;
use ws_transport::ws::state::ConnectionState;
use ws_transport::ws::time::SystemClock;

fn config(url: &str) -> ConnectionConfig {
    let mut cfg = ConnectionConfig::new(url);
    cfg.dial_timeout = Duration::from_millis(200);
    cfg.heartbeat.ping_period = Duration::from_millis(30);
    cfg.heartbeat.pong_wait = Duration::from_millis(100);
    cfg
}

async fn wait_connected(conn: &Arc<Connection>) {
    let mut rx = conn.state_receiver();
    while *rx.borrow() != ConnectionState::Connected {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

#[tokio::test]
async fn stays_healthy_while_the_server_answers_pings() {
    let server = MockServer::start().await;
    let conn = Connection::new(config(&server.ws_url()), Arc::new(SystemClock)).unwrap();
    wait_connected(&conn).await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(conn.heartbeat().is_healthy());
    let stats = conn.heartbeat().stats();
    assert!(stats.last_pong_at.is_some());
    assert!(conn.heartbeat().connection_health() > 0.0);

    conn.close();
}

#[tokio::test]
async fn drops_into_reconnecting_after_the_socket_disappears() {
    let server = MockServer::start().await;
    let conn = Connection::new(config(&server.ws_url()), Arc::new(SystemClock)).unwrap();
    wait_connected(&conn).await;

    server.disconnect_all();

    let mut rx = conn.state_receiver();
    let saw_reconnect = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if *rx.borrow() == ConnectionState::Reconnecting {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    assert!(saw_reconnect.is_ok(), "connection should drop into reconnecting state");

    conn.close();
}
