//! Managed WebSocket connection: state machine, read/write loop, reconnection.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use super::backoff::{calculate_backoff, with_jitter};
use super::config::ConnectionConfig;
use super::heartbeat::HeartbeatManager;
use super::id::ConnectionId;
use super::state::{ConnectionState, StateMachine};
use super::time::Clock;
use crate::error::{AlreadyConnecting, Closed, NotConnected};
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Broadcast channel capacity for incoming frames.
const BROADCAST_CAPACITY: usize = 1024;

/// Point-in-time snapshot of a [`Connection`]'s observable counters.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMetrics {
    pub connect_attempts: u64,
    pub successful_connects: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reconnect_attempts: u64,
    pub last_error: Option<String>,
}

/// Why a live `handle_connection` session ended.
enum SessionEnd {
    /// `close()` was called; the owning `Connection` must not be reused.
    Closed,
    /// `disconnect()` was called; stop retrying until `connect()` is called again.
    ExplicitDisconnect,
    /// Read/write error, server close frame, or heartbeat-triggered reconnect.
    Trouble,
}

/// A single managed WebSocket connection.
///
/// Owns exactly one socket at a time. Reconnection, backoff, and heartbeat
/// are all driven from a single background task spawned by [`Connection::new`]
/// or [`Connection::connect`]; there is never more than one such task alive
/// for a given instance.
pub struct Connection {
    id: ConnectionId,
    config: ConnectionConfig,
    state: Arc<StateMachine>,
    send_tx: mpsc::Sender<Message>,
    send_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    broadcast_tx: broadcast::Sender<Vec<u8>>,
    heartbeat: Arc<HeartbeatManager>,
    master_cancellation: CancellationToken,
    generation: Mutex<Option<CancellationToken>>,
    stop_requested: AtomicBool,
    attempt: AtomicU32,
    connect_attempts: AtomicU64,
    successful_connects: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    reconnect_attempts: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Connection {
    /// Builds a connection and immediately spawns its background session
    /// loop. The loop dials right away, same as calling `connect()`.
    pub fn new(config: ConnectionConfig, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        config.validate()?;
        let (send_tx, send_rx) = mpsc::channel(config.send_queue_size);
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let heartbeat = Arc::new(HeartbeatManager::new(config.heartbeat, clock));

        let this = Arc::new(Self {
            id: ConnectionId::next(),
            config,
            state: Arc::new(StateMachine::new(ConnectionState::Disconnected)),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            broadcast_tx,
            heartbeat,
            master_cancellation: CancellationToken::new(),
            generation: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            attempt: AtomicU32::new(0),
            connect_attempts: AtomicU64::new(0),
            successful_connects: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            last_error: Mutex::new(None),
        });

        this.spawn_session_loop()?;
        Ok(this)
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.broadcast_tx.subscribe()
    }

    #[must_use]
    pub fn heartbeat(&self) -> &Arc<HeartbeatManager> {
        &self.heartbeat
    }

    #[must_use]
    pub fn get_metrics(&self) -> ConnectionMetrics {
        ConnectionMetrics {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            successful_connects: self.successful_connects.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    fn record_error(&self, message: String) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    /// Queues a frame for the writer half of the active session.
    ///
    /// Frames queued while reconnecting are delivered once the next session
    /// establishes; frames are rejected once the connection is closed or has
    /// given up retrying.
    pub fn send(&self, payload: Vec<u8>) -> Result<()> {
        match self.state.get() {
            ConnectionState::Closed => return Err(Closed.into()),
            ConnectionState::Disconnected => return Err(NotConnected.into()),
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting => {}
        }
        self.send_tx
            .try_send(Message::Binary(payload.into()))
            .map_err(|_| crate::error::QueueFull {
                capacity: self.config.send_queue_size,
            })?;
        Ok(())
    }

    /// (Re)starts the background session loop if currently `Disconnected`.
    /// A no-op once `Closed`; returns an error if a session is already live.
    pub fn connect(self: &Arc<Self>) -> Result<()> {
        match self.state.get() {
            ConnectionState::Closed => Err(Closed.into()),
            ConnectionState::Disconnected => {
                self.stop_requested.store(false, Ordering::Release);
                self.spawn_session_loop()
            }
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting => {
                Err(AlreadyConnecting.into())
            }
        }
    }

    /// Tears down the active session and stops retrying, without closing the
    /// connection permanently. `connect()` can be called again afterward.
    pub fn disconnect(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.cancel_generation();
    }

    /// Permanently closes the connection. Idempotent.
    pub fn close(&self) {
        self.master_cancellation.cancel();
        self.cancel_generation();
        let _ = self.state.try_transition(ConnectionState::Closed);
    }

    fn cancel_generation(&self) {
        if let Some(token) = self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            token.cancel();
        }
    }

    fn spawn_session_loop(self: &Arc<Self>) -> Result<()> {
        let mut guard = self
            .send_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(send_rx) = guard.take() else {
            return Err(AlreadyConnecting.into());
        };
        drop(guard);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.session_loop(send_rx).await;
        });
        Ok(())
    }

    async fn session_loop(self: Arc<Self>, mut send_rx: mpsc::Receiver<Message>) {
        loop {
            if self.master_cancellation.is_cancelled() {
                let _ = self.state.try_transition(ConnectionState::Closed);
                break;
            }

            let _ = self.state.try_transition(ConnectionState::Connecting);
            let generation = self.master_cancellation.child_token();
            *self
                .generation
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(generation.clone());

            self.connect_attempts.fetch_add(1, Ordering::Relaxed);
            match self.dial(&generation).await {
                Ok(ws_stream) => {
                    self.attempt.store(0, Ordering::Relaxed);
                    self.successful_connects.fetch_add(1, Ordering::Relaxed);
                    let _ = self.state.try_transition(ConnectionState::Connected);

                    let end = self.run_session(ws_stream, &mut send_rx, &generation).await;
                    self.heartbeat.stop();

                    match end {
                        SessionEnd::Closed => {
                            let _ = self.state.try_transition(ConnectionState::Closed);
                            break;
                        }
                        SessionEnd::ExplicitDisconnect => {
                            let _ = self.state.try_transition(ConnectionState::Disconnected);
                            break;
                        }
                        SessionEnd::Trouble => {
                            if self.stop_requested.load(Ordering::Acquire) {
                                let _ = self.state.try_transition(ConnectionState::Disconnected);
                                break;
                            }
                            if !self.back_off_and_continue().await {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "dial attempt failed");
                    self.record_error(e.to_string());

                    if self.master_cancellation.is_cancelled() {
                        let _ = self.state.try_transition(ConnectionState::Closed);
                        break;
                    }
                    if self.stop_requested.load(Ordering::Acquire) {
                        let _ = self.state.try_transition(ConnectionState::Disconnected);
                        break;
                    }
                    if !self.back_off_and_continue().await {
                        break;
                    }
                }
            }
        }

        *self
            .send_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(send_rx);
    }

    /// Sleeps out the current backoff delay, then reports whether the loop
    /// should keep retrying (`false` once `max_attempts` is exhausted).
    async fn back_off_and_continue(&self) -> bool {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        let attempt = self.attempt.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(max) = self.config.reconnect.max_attempts
            && attempt > max
        {
            let _ = self.state.try_transition(ConnectionState::Disconnected);
            return false;
        }

        let _ = self.state.try_transition(ConnectionState::Reconnecting);
        let delay = with_jitter(calculate_backoff(
            attempt,
            self.config.reconnect.initial_delay,
            self.config.reconnect.max_delay,
            self.config.reconnect.multiplier,
        ));

        tokio::select! {
            () = sleep(delay) => true,
            () = self.master_cancellation.cancelled() => false,
        }
    }

    fn build_request(&self) -> Result<tokio_tungstenite::tungstenite::http::Request<()>> {
        let mut request = self.config.url.as_str().into_client_request()?;
        for (name, value) in &self.config.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::invalid_config(format!("invalid header name: {name}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|_| Error::invalid_config(format!("invalid header value for {name}")))?;
            request.headers_mut().insert(header_name, header_value);
        }
        Ok(request)
    }

    async fn dial(&self, generation: &CancellationToken) -> Result<WsStream> {
        let request = self.build_request()?;
        let dial = async {
            let (stream, _response) = connect_async(request).await?;
            Ok::<_, Error>(stream)
        };

        tokio::select! {
            result = timeout(self.config.dial_timeout, dial) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(crate::error::DialTimeout.into()),
                }
            }
            () = generation.cancelled() => Err(crate::error::Canceled.into()),
        }
    }

    async fn run_session(
        self: &Arc<Self>,
        ws_stream: WsStream,
        send_rx: &mut mpsc::Receiver<Message>,
        generation: &CancellationToken,
    ) -> SessionEnd {
        let (mut write, mut read) = ws_stream.split();
        let (ping_tx, mut ping_rx) = mpsc::unbounded_channel();

        let state = Arc::clone(&self.state);
        let is_connected = Arc::new(move || state.get().is_connected());
        let reconnect_trigger = generation.clone();
        let request_reconnect: Arc<dyn Fn() + Send + Sync> =
            Arc::new(move || reconnect_trigger.cancel());

        self.heartbeat.start(ping_tx, request_reconnect, is_connected);

        loop {
            tokio::select! {
                () = generation.cancelled() => {
                    if self.master_cancellation.is_cancelled() {
                        return SessionEnd::Closed;
                    }
                    if self.stop_requested.load(Ordering::Acquire) {
                        return SessionEnd::ExplicitDisconnect;
                    }
                    return SessionEnd::Trouble;
                }

                frame = timeout(self.config.read_timeout, read.next()) => {
                    match frame {
                        Ok(Some(Ok(Message::Pong(_)))) => {
                            self.heartbeat.on_pong();
                        }
                        Ok(Some(Ok(Message::Ping(payload)))) => {
                            if write.send(Message::Pong(payload)).await.is_err() {
                                return SessionEnd::Trouble;
                            }
                        }
                        Ok(Some(Ok(Message::Text(text)))) => {
                            self.messages_received.fetch_add(1, Ordering::Relaxed);
                            self.bytes_received.fetch_add(text.len() as u64, Ordering::Relaxed);
                            let _ = self.broadcast_tx.send(text.as_bytes().to_vec());
                        }
                        Ok(Some(Ok(Message::Binary(bytes)))) => {
                            self.messages_received.fetch_add(1, Ordering::Relaxed);
                            self.bytes_received.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                            let _ = self.broadcast_tx.send(bytes.to_vec());
                        }
                        Ok(Some(Ok(Message::Close(_)))) => {
                            return SessionEnd::Trouble;
                        }
                        Ok(Some(Ok(_))) => {}
                        Ok(Some(Err(e))) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(error = %e, "websocket read error");
                            self.record_error(e.to_string());
                            return SessionEnd::Trouble;
                        }
                        Ok(None) => return SessionEnd::Trouble,
                        Err(_) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!("no frame received within read_timeout");
                            self.record_error("no frame received within read_timeout".to_owned());
                            return SessionEnd::Trouble;
                        }
                    }
                }

                Some(()) = ping_rx.recv() => {
                    if timeout(self.config.write_timeout, write.send(Message::Ping(Vec::new().into())))
                        .await
                        .is_err()
                    {
                        return SessionEnd::Trouble;
                    }
                }

                Some(msg) = send_rx.recv() => {
                    let len = match &msg {
                        Message::Text(text) => text.len() as u64,
                        Message::Binary(bytes) => bytes.len() as u64,
                        _ => 0,
                    };
                    if timeout(self.config.write_timeout, write.send(msg)).await.is_err() {
                        return SessionEnd::Trouble;
                    }
                    self.messages_sent.fetch_add(1, Ordering::Relaxed);
                    self.bytes_sent.fetch_add(len, Ordering::Relaxed);
                }
            }
        }
    }
}
