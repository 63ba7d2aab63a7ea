#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::collections::HashMap;
use std::time::Duration;

use crate::Result;
use crate::error::Error;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_PING_PERIOD: Duration = Duration::from_secs(30);
const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(60);
const DEFAULT_INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_RECONNECT_MULTIPLIER: f64 = 2.0;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
const DEFAULT_SEND_QUEUE_SIZE: usize = 256;

/// Configuration for a single managed WebSocket connection.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_message_size: usize,
    pub send_queue_size: usize,
    pub enable_compression: bool,
    pub headers: HashMap<String, String>,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectConfig,
}

impl ConnectionConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            send_queue_size: DEFAULT_SEND_QUEUE_SIZE,
            enable_compression: false,
            headers: HashMap::new(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Validates URL scheme and heartbeat coherence.
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(Error::invalid_config("url must not be empty"));
        }
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(Error::invalid_config(format!(
                "url must use ws:// or wss://, got {}",
                self.url
            )));
        }
        self.heartbeat.validate()
    }
}

/// Configuration for ping/pong liveness tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Interval between outbound pings. Heartbeat is disabled when this is zero.
    pub ping_period: Duration,
    /// Maximum time to wait for a pong before it counts as missed. Must
    /// exceed `ping_period` whenever heartbeat is enabled.
    pub pong_wait: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_period: DEFAULT_PING_PERIOD,
            pong_wait: DEFAULT_PONG_WAIT,
        }
    }
}

impl HeartbeatConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ping_period > Duration::ZERO && self.pong_wait <= self.ping_period {
            return Err(Error::invalid_config(
                "pong_wait must be greater than ping_period",
            ));
        }
        Ok(())
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    /// `None` means unbounded retries.
    pub max_attempts: Option<u32>,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(DEFAULT_MAX_RECONNECT_ATTEMPTS),
            initial_delay: DEFAULT_INITIAL_RECONNECT_DELAY,
            max_delay: DEFAULT_MAX_RECONNECT_DELAY,
            multiplier: DEFAULT_RECONNECT_MULTIPLIER,
        }
    }
}

/// Configuration for a [`crate::ws::pool::ConnectionPool`].
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub urls: Vec<String>,
    pub min_connections: usize,
    pub max_connections: usize,
    pub shutdown_timeout: Duration,
}

impl PoolConfig {
    #[must_use]
    pub fn new(urls: Vec<String>) -> Self {
        let count = urls.len().max(1);
        Self {
            urls,
            min_connections: count,
            max_connections: count,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// What the backpressure monitor does once `dropped_events >= max_dropped`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureAction {
    /// No-op; the event is only recorded.
    Log,
    /// Restart the owning pool.
    Reconnect,
    /// Tear down the whole transport.
    Stop,
    /// Sleep 100ms and halve the dropped-events counter.
    SlowDown,
}

/// Configuration for the ingress channel-usage monitor.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct BackpressureConfig {
    pub buffer_size: usize,
    pub threshold_pct: f64,
    pub max_dropped: u64,
    pub monitoring_interval: Duration,
    pub action: BackpressureAction,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            threshold_pct: 80.0,
            max_dropped: 1000,
            monitoring_interval: Duration::from_secs(1),
            action: BackpressureAction::Log,
        }
    }
}

/// Configuration for the [`crate::ws::transport::Transport`] façade.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub pool: PoolConfig,
    pub backpressure: BackpressureConfig,
    pub event_timeout: Duration,
    pub max_event_size: usize,
    pub enable_event_validation: bool,
    pub cleanup_interval: Duration,
    pub subscription_idle_ttl: Duration,
}

impl TransportConfig {
    #[must_use]
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            pool: PoolConfig::new(urls),
            backpressure: BackpressureConfig::default(),
            event_timeout: Duration::from_secs(5),
            max_event_size: DEFAULT_MAX_MESSAGE_SIZE,
            enable_event_validation: false,
            cleanup_interval: Duration::from_secs(60),
            subscription_idle_ttl: Duration::from_secs(3600),
        }
    }
}
