//! A fixed set of [`Connection`]s load-balanced round robin, with a
//! background task that watches for unhealthy members.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;

use super::config::PoolConfig;
use super::connection::Connection;
use super::time::Clock;
use crate::Result;
use crate::error::NoHealthyConnections;

/// How often the health supervisor polls member connection state.
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// A pool of equivalent WebSocket connections, one per configured URL.
///
/// Selection is round robin over whichever members currently report
/// `Connected`; a member that drops out of that set is skipped until its own
/// reconnect loop brings it back, without the pool itself retrying on its
/// behalf.
pub struct ConnectionPool {
    members: Vec<Arc<Connection>>,
    cursor: AtomicUsize,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, clock: Arc<dyn Clock>, connection_config: impl Fn(&str) -> super::config::ConnectionConfig) -> Result<Arc<Self>> {
        let members = config
            .urls
            .iter()
            .map(|url| Connection::new(connection_config(url), Arc::clone(&clock)))
            .collect::<Result<Vec<_>>>()?;

        let this = Arc::new(Self {
            members,
            cursor: AtomicUsize::new(0),
            supervisor: std::sync::Mutex::new(None),
            shutdown_timeout: config.shutdown_timeout,
        });
        this.spawn_supervisor();
        Ok(this)
    }

    fn spawn_supervisor(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(HEALTH_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                let healthy = this.healthy_count();
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    healthy,
                    total = this.members.len(),
                    "connection pool health poll"
                );
                #[cfg(not(feature = "tracing"))]
                let _ = healthy;
            }
        });
        *self
            .supervisor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);
    }

    #[must_use]
    pub fn healthy_count(&self) -> usize {
        self.members
            .iter()
            .filter(|c| c.state().is_connected())
            .count()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Selects the next healthy connection in round-robin order.
    pub fn select(&self) -> Result<Arc<Connection>> {
        let len = self.members.len();
        if len == 0 {
            return Err(NoHealthyConnections.into());
        }
        for _ in 0..len {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
            let candidate = Arc::clone(&self.members[idx]);
            if candidate.state().is_connected() {
                return Ok(candidate);
            }
        }
        Err(NoHealthyConnections.into())
    }

    #[must_use]
    pub fn members(&self) -> &[Arc<Connection>] {
        &self.members
    }

    /// Closes every member connection, waiting up to `shutdown_timeout` for
    /// their background session loops to settle.
    pub async fn shutdown(&self) {
        if let Some(handle) = self
            .supervisor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        for member in &self.members {
            member.close();
        }
        let _ = tokio::time::timeout(self.shutdown_timeout, async {
            for member in &self.members {
                let mut rx = member.state_receiver();
                while !rx.borrow().is_closed() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::config::ConnectionConfig;
    use crate::ws::time::SystemClock;

    fn pool_config() -> PoolConfig {
        PoolConfig::new(vec![
            "ws://127.0.0.1:1".to_owned(),
            "ws://127.0.0.1:2".to_owned(),
        ])
    }

    #[tokio::test]
    async fn select_fails_when_no_member_is_connected() {
        let pool = ConnectionPool::new(pool_config(), Arc::new(SystemClock), |url| {
            let mut cfg = ConnectionConfig::new(url);
            cfg.reconnect.max_attempts = Some(0);
            cfg.dial_timeout = Duration::from_millis(20);
            cfg
        })
        .unwrap();

        assert!(pool.select().is_err());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn size_matches_configured_urls() {
        let pool = ConnectionPool::new(pool_config(), Arc::new(SystemClock), |url| {
            let mut cfg = ConnectionConfig::new(url);
            cfg.reconnect.max_attempts = Some(0);
            cfg
        })
        .unwrap();
        assert_eq!(pool.size(), 2);
        pool.shutdown().await;
    }
}
