//! Transport façade: the single entry point callers hold onto.
//!
//! Wires a [`ConnectionPool`] to an [`IngressBuffer`], a
//! [`SubscriptionRegistry`], and a [`BackpressureMonitor`], and exposes
//! `publish`/`subscribe` as the only two operations most callers need.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::interval;

use super::backpressure::BackpressureMonitor;
use super::config::{BackpressureAction, ConnectionConfig, TransportConfig};
use super::id::SubscriptionId;
use super::ingress::IngressBuffer;
use super::pool::ConnectionPool;
use super::subscription::SubscriptionRegistry;
use super::time::Clock;
use super::traits::{Serializer, Validator};
use crate::error::Kind;
use crate::{Error, Result};

/// Smoothing factor for the publish-latency exponential moving average (1/10).
const LATENCY_EMA_SHIFT: i128 = 10;

/// Point-in-time snapshot of a [`Transport`]'s accounting counters. Every
/// counter except `active_subscriptions` (a gauge) only ever increases.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    pub events_sent: u64,
    pub bytes_transferred: u64,
    pub events_received: u64,
    pub events_processed: u64,
    pub events_failed: u64,
    pub connection_errors: u64,
    pub timeout_errors: u64,
    pub serialization_failures: u64,
    pub backpressure_events: u64,
    pub dropped_events: u64,
    pub active_subscriptions: u64,
    pub latency_ema: Option<Duration>,
}

/// Typed, pluggable event transport over a pool of managed WebSocket
/// connections.
pub struct Transport<E>
where
    E: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    config: TransportConfig,
    pool: Arc<ConnectionPool>,
    serializer: Arc<dyn Serializer<E>>,
    validator: Option<Arc<dyn Validator<E>>>,
    registry: Arc<SubscriptionRegistry<E>>,
    ingress: Arc<IngressBuffer>,
    backpressure: Arc<BackpressureMonitor>,
    clock: Arc<dyn Clock>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    events_sent: AtomicU64,
    bytes_transferred: AtomicU64,
    events_received: AtomicU64,
    events_processed: AtomicU64,
    events_failed: AtomicU64,
    connection_errors: AtomicU64,
    timeout_errors: AtomicU64,
    serialization_failures: AtomicU64,
    backpressure_events: AtomicU64,
    latency_ema_nanos: AtomicU64,
    _marker: PhantomData<E>,
}

impl<E> Transport<E>
where
    E: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        config: TransportConfig,
        serializer: impl Serializer<E>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        Self::with_validator(config, serializer, None, clock)
    }

    pub fn with_validator(
        config: TransportConfig,
        serializer: impl Serializer<E>,
        validator: Option<Arc<dyn Validator<E>>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        let max_event_size = config.max_event_size;
        let pool = ConnectionPool::new(config.pool.clone(), Arc::clone(&clock), move |url| {
            let mut cfg = ConnectionConfig::new(url);
            cfg.max_message_size = max_event_size;
            cfg
        })?;

        let this = Arc::new(Self {
            ingress: Arc::new(IngressBuffer::new(config.backpressure.buffer_size)),
            backpressure: Arc::new(BackpressureMonitor::new(config.backpressure)),
            registry: Arc::new(SubscriptionRegistry::new(Arc::clone(&clock))),
            serializer: Arc::new(serializer),
            validator,
            config,
            pool,
            clock,
            tasks: std::sync::Mutex::new(Vec::new()),
            events_sent: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            events_received: AtomicU64::new(0),
            events_processed: AtomicU64::new(0),
            events_failed: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            timeout_errors: AtomicU64::new(0),
            serialization_failures: AtomicU64::new(0),
            backpressure_events: AtomicU64::new(0),
            latency_ema_nanos: AtomicU64::new(0),
            _marker: PhantomData,
        });

        this.spawn_fan_in_tasks();
        this.spawn_dispatch_task();
        this.spawn_backpressure_task();
        this.spawn_janitor_task();
        Ok(this)
    }

    /// One task per pool member, forwarding its raw broadcast frames into
    /// the shared ingress buffer.
    fn spawn_fan_in_tasks(self: &Arc<Self>) {
        let mut handles = Vec::new();
        for member in self.pool.members() {
            let mut rx = member.subscribe();
            let ingress = Arc::clone(&self.ingress);
            handles.push(tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(frame) => {
                            ingress.push(frame);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend(handles);
    }

    fn spawn_dispatch_task(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let frame = this.ingress.pop().await;
                this.handle_frame(&frame);
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(handle);
    }

    fn handle_frame(&self, frame: &[u8]) {
        self.events_received.fetch_add(1, Ordering::Relaxed);

        let event_type = match self.serializer.extract_type(frame) {
            Ok(t) => t,
            Err(e) => {
                self.events_failed.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "dropping frame with unreadable type");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return;
            }
        };

        let event: E = match serde_json::from_slice(frame) {
            Ok(e) => e,
            Err(e) => {
                self.events_failed.fetch_add(1, Ordering::Relaxed);
                self.serialization_failures.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "tracing")]
                tracing::warn!(%event_type, error = %e, "dropping frame that failed to deserialize");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return;
            }
        };

        if self.config.enable_event_validation
            && let Some(validator) = &self.validator
        {
            let outcome = validator.validate(&event);
            if !outcome.valid {
                self.events_failed.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "tracing")]
                tracing::warn!(%event_type, errors = ?outcome.errors, "dropping event that failed validation");
                return;
            }
        }

        self.events_processed.fetch_add(1, Ordering::Relaxed);
        self.registry.dispatch(&event_type, &event);
    }

    /// Runs on `cleanup_interval`, pruning subscriptions idle for longer than
    /// `subscription_idle_ttl` and logging a cheap activity snapshot in
    /// place of goroutine/heap counts, which have no stable equivalent here.
    fn spawn_janitor_task(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(this.config.cleanup_interval);
            loop {
                ticker.tick().await;
                let pruned = this.registry.prune_idle(this.config.subscription_idle_ttl);
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    pruned,
                    active_subscriptions = this.registry.subscription_count(),
                    ingress_len = this.ingress.len(),
                    tasks = this
                        .tasks
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .len(),
                    "resource janitor sweep"
                );
                #[cfg(not(feature = "tracing"))]
                let _ = pruned;
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(handle);
    }

    fn spawn_backpressure_task(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(this.config.backpressure.monitoring_interval);
            loop {
                ticker.tick().await;
                if let Some(action) = this.backpressure.sample(&this.ingress) {
                    this.handle_backpressure_action(action).await;
                }
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(handle);
    }

    async fn handle_backpressure_action(&self, action: BackpressureAction) {
        self.backpressure_events.fetch_add(1, Ordering::Relaxed);
        match action {
            BackpressureAction::Log => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    dropped = self.ingress.dropped_count(),
                    "sustained backpressure"
                );
            }
            BackpressureAction::SlowDown => {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
            BackpressureAction::Reconnect => {
                for member in self.pool.members() {
                    member.disconnect();
                    let _ = member.connect();
                }
            }
            BackpressureAction::Stop => {
                self.close().await;
            }
        }
    }

    /// Encodes and sends `event` over a healthy pool member, updating the
    /// send counters and the publish-latency EMA on success.
    pub async fn publish(&self, event: &E) -> Result<()> {
        let bytes = match self.serializer.serialize(event) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.serialization_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        if bytes.len() > self.config.max_event_size {
            self.events_failed.fetch_add(1, Ordering::Relaxed);
            return Err(Error::event_too_large(self.config.max_event_size, bytes.len()));
        }
        let connection = match self.pool.select() {
            Ok(connection) => connection,
            Err(e) => {
                self.connection_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let len = bytes.len() as u64;
        let started = self.clock.now();
        let result = tokio::time::timeout(self.config.event_timeout, async { connection.send(bytes) }).await;

        match result {
            Ok(Ok(())) => {
                self.events_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_transferred.fetch_add(len, Ordering::Relaxed);
                self.update_latency(self.clock.now().saturating_duration_since(started));
                Ok(())
            }
            Ok(Err(e)) => {
                self.connection_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
            Err(_) => {
                self.timeout_errors.fetch_add(1, Ordering::Relaxed);
                Err(Error::with_source(Kind::Canceled, crate::error::DeadlineExceeded))
            }
        }
    }

    fn update_latency(&self, latency: Duration) {
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        let prev = self.latency_ema_nanos.load(Ordering::Relaxed);
        let next = if prev == 0 {
            nanos
        } else {
            let diff = i128::from(nanos) - i128::from(prev);
            u64::try_from(i128::from(prev) + diff / LATENCY_EMA_SHIFT).unwrap_or(prev)
        };
        self.latency_ema_nanos.store(next, Ordering::Relaxed);
    }

    /// Snapshot of every accounting counter, always available regardless of
    /// pool health.
    #[must_use]
    pub fn stats(&self) -> TransportStats {
        let ema = self.latency_ema_nanos.load(Ordering::Relaxed);
        TransportStats {
            events_sent: self.events_sent.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            timeout_errors: self.timeout_errors.load(Ordering::Relaxed),
            serialization_failures: self.serialization_failures.load(Ordering::Relaxed),
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
            dropped_events: self.ingress.dropped_count(),
            active_subscriptions: self.registry.subscription_count() as u64,
            latency_ema: (ema > 0).then(|| Duration::from_nanos(ema)),
        }
    }

    /// [`Transport::stats`] plus pool gauges, rendered as display strings for
    /// ad hoc inspection rather than typed consumption.
    #[must_use]
    pub fn get_detailed_status(&self) -> HashMap<String, String> {
        let stats = self.stats();
        let mut status = HashMap::new();
        status.insert("events_sent".to_owned(), stats.events_sent.to_string());
        status.insert("bytes_transferred".to_owned(), stats.bytes_transferred.to_string());
        status.insert("events_received".to_owned(), stats.events_received.to_string());
        status.insert("events_processed".to_owned(), stats.events_processed.to_string());
        status.insert("events_failed".to_owned(), stats.events_failed.to_string());
        status.insert("connection_errors".to_owned(), stats.connection_errors.to_string());
        status.insert("timeout_errors".to_owned(), stats.timeout_errors.to_string());
        status.insert(
            "serialization_failures".to_owned(),
            stats.serialization_failures.to_string(),
        );
        status.insert("backpressure_events".to_owned(), stats.backpressure_events.to_string());
        status.insert("dropped_events".to_owned(), stats.dropped_events.to_string());
        status.insert("active_subscriptions".to_owned(), stats.active_subscriptions.to_string());
        status.insert(
            "latency_ema_micros".to_owned(),
            stats
                .latency_ema
                .map_or_else(|| "n/a".to_owned(), |d| d.as_micros().to_string()),
        );
        status.insert("pool_size".to_owned(), self.pool.size().to_string());
        status.insert("pool_healthy".to_owned(), self.pool.healthy_count().to_string());
        status
    }

    /// `true` once at least one pool member reports `Connected`.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.pool.healthy_count() > 0
    }

    /// Confirms a healthy pool member is selectable without sending anything.
    pub fn ping(&self) -> Result<()> {
        self.pool.select()?;
        Ok(())
    }

    /// Registers `handler` for every type in `types`, returning one
    /// subscription id that [`Transport::unsubscribe`] removes all of at
    /// once.
    #[must_use]
    pub fn subscribe<F>(&self, types: impl IntoIterator<Item = impl Into<String>>, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.registry.subscribe(types, handler)
    }

    /// Removes every handler installed by the `subscribe` call that
    /// returned `id`. Returns `false` if `id` is not a live subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.unsubscribe(id)
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Shuts down the pool and every background task. Idempotent.
    pub async fn close(&self) {
        for handle in self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::ws::time::SystemClock;
    use crate::ws::traits::JsonSerializer;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TestEvent {
        #[serde(rename = "type")]
        kind: String,
        value: u32,
    }

    fn config() -> TransportConfig {
        let mut cfg = TransportConfig::new(vec!["ws://127.0.0.1:1".to_owned()]);
        cfg.pool.shutdown_timeout = std::time::Duration::from_millis(50);
        cfg
    }

    #[tokio::test]
    async fn publish_fails_with_no_healthy_connection() {
        let transport = Transport::<TestEvent>::new(
            config(),
            JsonSerializer::new(),
            Arc::new(SystemClock),
        )
        .unwrap();

        let result = transport
            .publish(&TestEvent {
                kind: "ping".to_owned(),
                value: 1,
            })
            .await;
        assert!(result.is_err());
        assert_eq!(transport.stats().connection_errors, 1);
        assert!(!transport.is_connected());
        transport.close().await;
    }

    #[tokio::test]
    async fn publish_rejects_oversized_events() {
        let mut cfg = config();
        cfg.max_event_size = 4;
        let transport =
            Transport::<TestEvent>::new(cfg, JsonSerializer::new(), Arc::new(SystemClock)).unwrap();

        let result = transport
            .publish(&TestEvent {
                kind: "ping".to_owned(),
                value: 1,
            })
            .await;
        assert!(result.is_err());
        assert_eq!(transport.stats().events_failed, 1);
        transport.close().await;
    }

    #[tokio::test]
    async fn dispatch_routes_decoded_frames_to_subscribers() {
        let transport = Arc::new(
            Transport::<TestEvent>::new(config(), JsonSerializer::new(), Arc::new(SystemClock))
                .unwrap(),
        );
        let received = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let received_clone = Arc::clone(&received);
        transport.subscribe(["ping"], move |event: &TestEvent| {
            received_clone.store(event.value, std::sync::atomic::Ordering::Relaxed);
        });

        transport.handle_frame(br#"{"type":"ping","value":42}"#);
        assert_eq!(received.load(std::sync::atomic::Ordering::Relaxed), 42);
        let stats = transport.stats();
        assert_eq!(stats.events_received, 1);
        assert_eq!(stats.events_processed, 1);
        assert_eq!(stats.events_failed, 0);
        transport.close().await;
    }

    #[tokio::test]
    async fn handle_frame_counts_unreadable_and_undeserializable_frames_as_failed() {
        let transport = Arc::new(
            Transport::<TestEvent>::new(config(), JsonSerializer::new(), Arc::new(SystemClock))
                .unwrap(),
        );

        transport.handle_frame(b"not json at all");
        let stats = transport.stats();
        assert_eq!(stats.events_received, 1);
        assert_eq!(stats.events_failed, 1);
        assert_eq!(stats.events_processed, 0);
        transport.close().await;
    }

    #[tokio::test]
    async fn janitor_prunes_subscriptions_idle_past_the_ttl() {
        let mut cfg = config();
        cfg.cleanup_interval = std::time::Duration::from_millis(10);
        cfg.subscription_idle_ttl = std::time::Duration::from_millis(1);
        let transport = Arc::new(
            Transport::<TestEvent>::new(cfg, JsonSerializer::new(), Arc::new(SystemClock)).unwrap(),
        );
        transport.subscribe(["ping"], |_: &TestEvent| {});
        assert_eq!(transport.stats().active_subscriptions, 1);

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(transport.stats().active_subscriptions, 0);
        transport.close().await;
    }
}
