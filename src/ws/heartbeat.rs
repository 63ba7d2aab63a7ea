//! Ping/pong liveness and RTT tracking bound to a [`crate::ws::connection::Connection`].

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;

use super::config::HeartbeatConfig;
use super::time::Clock;

/// Consecutive missed pongs after which a reconnect is requested, once per
/// outage, while the owning connection is `Connected`.
const MISSED_PONG_ESCALATION_THRESHOLD: u32 = 3;
/// Smoothing factor for the RTT exponential moving average (1/8).
const RTT_EMA_SHIFT: i128 = 8;

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatStats {
    pub last_ping_at: Option<Instant>,
    pub last_pong_at: Option<Instant>,
    pub consecutive_missed_pongs: u32,
    pub is_healthy: bool,
    pub rtt_ema: Option<Duration>,
    pub rtt_min: Option<Duration>,
    pub rtt_max: Option<Duration>,
}

struct Inner {
    last_ping_at: Mutex<Option<Instant>>,
    last_pong_at: Mutex<Option<Instant>>,
    missed_pongs: AtomicU32,
    healthy: AtomicBool,
    reconnect_requested_this_outage: AtomicBool,
    rtt_ema_nanos: AtomicU64,
    rtt_min_nanos: AtomicU64,
    rtt_max_nanos: AtomicU64,
}

impl Inner {
    fn new() -> Self {
        Self {
            last_ping_at: Mutex::new(None),
            last_pong_at: Mutex::new(None),
            missed_pongs: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
            reconnect_requested_this_outage: AtomicBool::new(false),
            rtt_ema_nanos: AtomicU64::new(0),
            rtt_min_nanos: AtomicU64::new(u64::MAX),
            rtt_max_nanos: AtomicU64::new(0),
        }
    }
}

struct Handles {
    ping_tx: mpsc::UnboundedSender<()>,
    request_reconnect: Arc<dyn Fn() + Send + Sync>,
    is_connected: Arc<dyn Fn() -> bool + Send + Sync>,
}

/// Owns its two workers (pinger, health-checker) exclusively; neither holds a
/// strong back-reference to the owning `Connection` beyond the narrow
/// `request_reconnect` capability handed to `start`.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    clock: Arc<dyn Clock>,
    inner: Arc<Inner>,
    handles: Mutex<Option<Handles>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HeartbeatManager {
    #[must_use]
    pub fn new(config: HeartbeatConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Arc::new(Inner::new()),
            handles: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Starts both workers for a freshly established socket. Resets
    /// liveness stats (but not RTT history) since this binds to a new
    /// outage-free epoch.
    pub fn start(
        self: &Arc<Self>,
        ping_tx: mpsc::UnboundedSender<()>,
        request_reconnect: Arc<dyn Fn() + Send + Sync>,
        is_connected: Arc<dyn Fn() -> bool + Send + Sync>,
    ) {
        self.stop();
        *self
            .inner
            .last_pong_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(self.clock.now());
        self.inner.missed_pongs.store(0, Ordering::Relaxed);
        self.inner.healthy.store(true, Ordering::Relaxed);
        self.inner
            .reconnect_requested_this_outage
            .store(false, Ordering::Relaxed);

        *self.handles.lock().unwrap_or_else(PoisonError::into_inner) = Some(Handles {
            ping_tx,
            request_reconnect,
            is_connected,
        });
        self.spawn_tasks();
    }

    /// Restarts both tickers without draining stats, per the `Reset`
    /// operation in the component design.
    pub fn reset(self: &Arc<Self>) {
        self.abort_tasks();
        self.spawn_tasks();
    }

    fn spawn_tasks(self: &Arc<Self>) {
        let mut tasks = Vec::with_capacity(2);
        let Some(handles) = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|h| Handles {
                ping_tx: h.ping_tx.clone(),
                request_reconnect: Arc::clone(&h.request_reconnect),
                is_connected: Arc::clone(&h.is_connected),
            })
        else {
            return;
        };

        if self.config.ping_period > Duration::ZERO {
            let this = Arc::clone(self);
            let ping_tx = handles.ping_tx.clone();
            tasks.push(tokio::spawn(async move {
                this.ping_loop(ping_tx).await;
            }));
        }

        if self.config.pong_wait > Duration::ZERO {
            let this = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                this.health_loop(handles.request_reconnect, handles.is_connected)
                    .await;
            }));
        }

        *self.tasks.lock().unwrap_or_else(PoisonError::into_inner) = tasks;
    }

    fn abort_tasks(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }

    /// Stops both workers. Idempotent.
    pub fn stop(&self) {
        self.abort_tasks();
        *self.handles.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    async fn ping_loop(self: Arc<Self>, ping_tx: mpsc::UnboundedSender<()>) {
        let mut ticker = interval(self.config.ping_period);
        loop {
            ticker.tick().await;
            *self
                .inner
                .last_ping_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(self.clock.now());
            if ping_tx.send(()).is_err() {
                #[cfg(feature = "tracing")]
                tracing::debug!("heartbeat ping channel closed, stopping pinger");
                break;
            }
        }
    }

    async fn health_loop(
        self: Arc<Self>,
        request_reconnect: Arc<dyn Fn() + Send + Sync>,
        is_connected: Arc<dyn Fn() -> bool + Send + Sync>,
    ) {
        let half_period = (self.config.ping_period / 2).max(Duration::from_millis(1));
        let mut ticker = interval(half_period);
        loop {
            ticker.tick().await;
            let now = self.clock.now();
            let stale = self
                .inner
                .last_pong_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_none_or(|last| now.duration_since(last) > self.config.pong_wait);

            if !stale {
                continue;
            }

            let missed = self.inner.missed_pongs.fetch_add(1, Ordering::AcqRel) + 1;
            self.inner.healthy.store(false, Ordering::Relaxed);

            #[cfg(feature = "tracing")]
            tracing::warn!(missed, "heartbeat missed pong");

            if missed >= MISSED_PONG_ESCALATION_THRESHOLD
                && is_connected()
                && !self
                    .inner
                    .reconnect_requested_this_outage
                    .swap(true, Ordering::AcqRel)
            {
                request_reconnect();
            }
        }
    }

    /// Called by the owning connection's reader worker on every pong frame.
    pub fn on_pong(&self) {
        let now = self.clock.now();
        let last_ping = *self
            .inner
            .last_ping_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *self
            .inner
            .last_pong_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(now);
        self.inner.missed_pongs.store(0, Ordering::Relaxed);
        self.inner.healthy.store(true, Ordering::Relaxed);
        self.inner
            .reconnect_requested_this_outage
            .store(false, Ordering::Relaxed);

        if let Some(sent) = last_ping {
            self.update_rtt(now.saturating_duration_since(sent));
        }
    }

    fn update_rtt(&self, rtt: Duration) {
        let rtt_nanos = u64::try_from(rtt.as_nanos()).unwrap_or(u64::MAX);

        let prev = self.inner.rtt_ema_nanos.load(Ordering::Relaxed);
        let next = if prev == 0 {
            rtt_nanos
        } else {
            let diff = i128::from(rtt_nanos) - i128::from(prev);
            u64::try_from(i128::from(prev) + diff / RTT_EMA_SHIFT).unwrap_or(prev)
        };
        self.inner.rtt_ema_nanos.store(next, Ordering::Relaxed);
        self.inner
            .rtt_min_nanos
            .fetch_min(rtt_nanos, Ordering::Relaxed);
        self.inner
            .rtt_max_nanos
            .fetch_max(rtt_nanos, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stats(&self) -> HeartbeatStats {
        let min = self.inner.rtt_min_nanos.load(Ordering::Relaxed);
        let max = self.inner.rtt_max_nanos.load(Ordering::Relaxed);
        let ema = self.inner.rtt_ema_nanos.load(Ordering::Relaxed);
        HeartbeatStats {
            last_ping_at: *self
                .inner
                .last_ping_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            last_pong_at: *self
                .inner
                .last_pong_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            consecutive_missed_pongs: self.inner.missed_pongs.load(Ordering::Relaxed),
            is_healthy: self.is_healthy(),
            rtt_ema: (ema > 0).then(|| Duration::from_nanos(ema)),
            rtt_min: (min < u64::MAX).then(|| Duration::from_nanos(min)),
            rtt_max: (max > 0).then(|| Duration::from_nanos(max)),
        }
    }

    /// Clamped linear health score in `[0, 1]`.
    #[must_use]
    pub fn connection_health(&self) -> f64 {
        if !self.is_healthy() {
            return 0.0;
        }
        let Some(last_pong) = *self
            .inner
            .last_pong_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
        else {
            return 0.0;
        };
        let window = self.config.pong_wait.as_secs_f64();
        if window <= 0.0 {
            return 1.0;
        }
        let elapsed = self.clock.now().duration_since(last_pong).as_secs_f64();
        (1.0 - elapsed / window).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::ws::time::SystemClock;

    fn manager(config: HeartbeatConfig) -> Arc<HeartbeatManager> {
        Arc::new(HeartbeatManager::new(config, Arc::new(SystemClock)))
    }

    #[test]
    fn healthy_by_default_before_start() {
        let hb = manager(HeartbeatConfig::default());
        assert!(hb.is_healthy());
    }

    #[tokio::test]
    async fn on_pong_resets_missed_count_and_marks_healthy() {
        let hb = manager(HeartbeatConfig {
            ping_period: Duration::from_millis(20),
            pong_wait: Duration::from_millis(50),
        });
        let (ping_tx, _ping_rx) = mpsc::unbounded_channel();
        hb.start(ping_tx, Arc::new(|| {}), Arc::new(|| true));
        hb.inner.missed_pongs.store(5, Ordering::Relaxed);
        hb.inner.healthy.store(false, Ordering::Relaxed);
        hb.on_pong();
        assert!(hb.is_healthy());
        assert_eq!(hb.stats().consecutive_missed_pongs, 0);
        hb.stop();
    }

    #[tokio::test]
    async fn escalates_reconnect_after_three_missed_pongs() {
        let hb = manager(HeartbeatConfig {
            ping_period: Duration::from_millis(10),
            pong_wait: Duration::from_millis(15),
        });
        let (ping_tx, _ping_rx) = mpsc::unbounded_channel();
        let requests = Arc::new(AtomicUsize::new(0));
        let requests_clone = Arc::clone(&requests);
        hb.start(
            ping_tx,
            Arc::new(move || {
                requests_clone.fetch_add(1, Ordering::Relaxed);
            }),
            Arc::new(|| true),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        hb.stop();
        assert!(requests.load(Ordering::Relaxed) >= 1);
        assert_eq!(
            requests.load(Ordering::Relaxed),
            1,
            "requested at most once per outage"
        );
    }

    #[test]
    fn connection_health_is_zero_when_unhealthy() {
        let hb = manager(HeartbeatConfig::default());
        hb.inner.healthy.store(false, Ordering::Relaxed);
        assert_eq!(hb.connection_health(), 0.0);
    }
}
