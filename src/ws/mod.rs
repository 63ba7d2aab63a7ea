//! Event transport over WebSocket: a single managed connection, a pool of
//! them, heartbeat liveness, and the subscription/backpressure machinery
//! built on top.
//!
//! # Architecture
//!
//! - [`connection::Connection`]: one socket, its state machine, and its
//!   reconnect loop.
//! - [`heartbeat::HeartbeatManager`]: ping/pong liveness and RTT tracking for
//!   a connection.
//! - [`state::StateMachine`]: the CAS-guarded connection state word shared by
//!   a connection and its observers.
//! - [`backoff`]: pure reconnect delay calculation plus jitter.
//! - [`traits::Serializer`] / [`traits::Validator`]: the two pluggable
//!   contracts a caller supplies for their event type.

pub mod backoff;
pub mod backpressure;
pub mod config;
pub mod connection;
pub mod heartbeat;
pub mod id;
pub mod ingress;
pub mod pool;
pub mod state;
pub mod subscription;
pub mod time;
pub mod traits;
pub mod transport;

pub use backpressure::BackpressureMonitor;
pub use config::{
    BackpressureAction, BackpressureConfig, ConnectionConfig, HeartbeatConfig, PoolConfig,
    ReconnectConfig, TransportConfig,
};
pub use connection::{Connection, ConnectionMetrics};
pub use heartbeat::{HeartbeatManager, HeartbeatStats};
pub use id::{ConnectionId, SubscriptionId};
pub use ingress::IngressBuffer;
pub use pool::ConnectionPool;
pub use state::ConnectionState;
pub use subscription::SubscriptionRegistry;
pub use time::{Clock, SystemClock};
pub use traits::{JsonSerializer, Serializer, ValidationOutcome, Validator};
pub use transport::{Transport, TransportStats};
