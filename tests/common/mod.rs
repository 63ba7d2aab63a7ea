#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

/// Mock event-transport server that accepts any number of clients and
/// broadcasts every sent frame to all of them.
pub struct MockServer {
    addr: SocketAddr,
    frame_tx: broadcast::Sender<String>,
    inbound_rx: mpsc::UnboundedReceiver<String>,
    disconnect_signal: Arc<AtomicBool>,
}

impl MockServer {
    /// Starts a server on a random loopback port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (frame_tx, _) = broadcast::channel::<String>(256);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
        let disconnect_signal = Arc::new(AtomicBool::new(false));

        let broadcast_tx = frame_tx.clone();
        let disconnect = Arc::clone(&disconnect_signal);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };

                let (mut write, mut read) = ws_stream.split();
                let inbound = inbound_tx.clone();
                let mut outbound = broadcast_tx.subscribe();
                let disconnect = Arc::clone(&disconnect);

                tokio::spawn(async move {
                    loop {
                        if disconnect.load(Ordering::SeqCst) {
                            break;
                        }
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        drop(inbound.send(text.to_string()));
                                    }
                                    Some(Ok(Message::Binary(bytes))) => {
                                        drop(inbound.send(String::from_utf8_lossy(&bytes).into_owned()));
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            msg = outbound.recv() => {
                                match msg {
                                    Ok(text) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                            () = tokio::time::sleep(Duration::from_millis(50)) => {
                                if disconnect.load(Ordering::SeqCst) {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            frame_tx,
            inbound_rx,
            disconnect_signal,
        }
    }

    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Broadcasts `payload` to every currently connected client.
    pub fn send(&self, payload: &str) {
        drop(self.frame_tx.send(payload.to_owned()));
    }

    /// Waits for the next frame a client sent to the server.
    pub async fn recv_inbound(&mut self) -> Option<String> {
        timeout(Duration::from_secs(2), self.inbound_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Forces every currently connected client session to drop.
    pub fn disconnect_all(&self) {
        self.disconnect_signal.store(true, Ordering::SeqCst);
    }

    /// Lets newly accepted (and reconnecting) clients stay up again.
    pub fn allow_reconnect(&self) {
        self.disconnect_signal.store(false, Ordering::SeqCst);
    }
}
