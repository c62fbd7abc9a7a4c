//! Bounded pool of provider connections

use super::{Connection, ConnectionError, ConnectionSlot, PoolSettings};
use crate::classifier::ErrorClassifier;
use crate::metrics;
use crate::provider::ProviderConnector;
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// Pool health summary
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    /// Connections accepting requests
    pub healthy_count: usize,
    /// Pooled connections that are no longer healthy
    pub stale_count: usize,
    /// Identities of every pooled connection
    pub identities: Vec<i32>,
    /// Per-connection detail
    pub slots: Vec<ConnectionSlot>,
}

/// Hands out healthy connections and creates new ones on demand
pub struct ConnectionManager {
    connector: Arc<dyn ProviderConnector>,
    classifier: Arc<ErrorClassifier>,
    settings: PoolSettings,
    pool: Mutex<Vec<Arc<Connection>>>,
    connecting: AtomicUsize,
    slot_released: Notify,
    next_identity: AtomicI32,
    shut_down: AtomicBool,
}

/// A pool slot held while its connection is established
struct Reservation<'a> {
    manager: &'a ConnectionManager,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.manager.connecting.fetch_sub(1, Ordering::AcqRel);
        self.manager.slot_released.notify_waiters();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("settings", &self.settings)
            .field("connecting", &self.connecting.load(Ordering::Relaxed))
            .field("next_identity", &self.next_identity.load(Ordering::Relaxed))
            .finish()
    }
}

impl ConnectionManager {
    /// Create an empty pool
    pub fn new(
        connector: Arc<dyn ProviderConnector>,
        classifier: Arc<ErrorClassifier>,
        settings: PoolSettings,
    ) -> Self {
        let next_identity = AtomicI32::new(settings.base_identity);
        Self {
            connector,
            classifier,
            settings,
            pool: Mutex::new(Vec::new()),
            connecting: AtomicUsize::new(0),
            slot_released: Notify::new(),
            next_identity,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Settings in force
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Classifier shared with every connection
    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.classifier
    }

    /// A healthy connection, creating one if needed.
    ///
    /// Unhealthy connections are purged first. An idle healthy connection is
    /// preferred; when all are busy a new one is created while the pool is
    /// under its bound, otherwise the least-loaded one is shared. The pool lock
    /// is not held while a new connection is established.
    pub async fn acquire(&self) -> Result<Arc<Connection>, ConnectionError> {
        let (reservation, fallback) = loop {
            if self.shut_down.load(Ordering::Acquire) {
                return Err(ConnectionError::ShutDown);
            }
            // Registered before the count is read so a release in between still wakes us.
            let released = self.slot_released.notified();

            let mut pool = self.pool.lock().await;
            self.purge(&mut pool);

            let occupied = pool.len() + self.connecting.load(Ordering::Acquire);
            let least_loaded = pool.iter().min_by_key(|c| c.pending()).cloned();
            if let Some(connection) = &least_loaded {
                if connection.pending() == 0 || occupied >= self.settings.max_connections {
                    return Ok(Arc::clone(connection));
                }
            }
            if occupied < self.settings.max_connections {
                self.connecting.fetch_add(1, Ordering::AcqRel);
                break (Reservation { manager: self }, least_loaded);
            }

            drop(pool);
            debug!("Every pool slot is being established, waiting");
            released.await;
        };

        match self.establish().await {
            Ok(connection) => {
                let connection = Arc::new(connection);
                let mut pool = self.pool.lock().await;
                if self.shut_down.load(Ordering::Acquire) {
                    drop(pool);
                    connection.stop().await;
                    return Err(ConnectionError::ShutDown);
                }
                pool.push(Arc::clone(&connection));
                self.publish(&pool);
                drop(pool);
                drop(reservation);
                Ok(connection)
            }
            Err(e) => {
                drop(reservation);
                match fallback {
                    Some(busy) if busy.is_healthy() => {
                        warn!(error = %e, identity = busy.identity(), "Could not grow pool, sharing a busy connection");
                        Ok(busy)
                    }
                    _ => Err(e),
                }
            }
        }
    }

    fn purge(&self, pool: &mut Vec<Arc<Connection>>) {
        let before = pool.len();
        let (healthy, unhealthy): (Vec<_>, Vec<_>) =
            pool.drain(..).partition(|connection| connection.is_healthy());
        *pool = healthy;

        for connection in unhealthy {
            info!(
                identity = connection.identity(),
                state = %connection.state(),
                "Purging unhealthy connection"
            );
            tokio::spawn(async move { connection.stop().await });
        }
        if pool.len() != before {
            self.publish(pool);
        }
    }

    /// Open a connection, rotating identity on conflicts
    async fn establish(&self) -> Result<Connection, ConnectionError> {
        let attempts = self.settings.max_identity_attempts.max(1);
        let mut last_identity = self.settings.base_identity;

        for attempt in 1..=attempts {
            let identity = self.next_identity.fetch_add(1, Ordering::AcqRel);
            last_identity = identity;
            debug!(identity, attempt, "Opening provider connection");

            match Connection::open(
                Arc::clone(&self.connector),
                identity,
                self.settings.connection.clone(),
                Arc::clone(&self.classifier),
            )
            .await
            {
                Ok(connection) => {
                    tokio::time::sleep(self.settings.health_check_delay).await;
                    if connection.is_healthy() {
                        return Ok(connection);
                    }
                    warn!(identity, "New connection failed its health check");
                    connection.stop().await;
                    return Err(ConnectionError::Unhealthy { identity });
                }
                Err(ConnectionError::Handshake { identity, error })
                    if self.classifier.is_identity_conflict(&error.message) =>
                {
                    warn!(
                        identity,
                        attempt,
                        max_attempts = attempts,
                        message = %error.message,
                        "Client identity in use, rotating"
                    );
                    metrics::record_identity_rotation();
                }
                Err(e) => return Err(e),
            }
        }

        Err(ConnectionError::IdentityExhausted {
            attempts,
            last_identity,
        })
    }

    fn publish(&self, pool: &[Arc<Connection>]) {
        let healthy = pool.iter().filter(|c| c.is_healthy()).count();
        metrics::record_pool_status(healthy, pool.len() - healthy);
    }

    /// Pool health summary
    pub async fn pool_status(&self) -> PoolStatus {
        let pool = self.pool.lock().await;
        let slots: Vec<ConnectionSlot> = pool.iter().map(|c| c.slot()).collect();
        let healthy_count = pool.iter().filter(|c| c.is_healthy()).count();
        PoolStatus {
            healthy_count,
            stale_count: pool.len() - healthy_count,
            identities: slots.iter().map(|s| s.identity).collect(),
            slots,
        }
    }

    /// Stop every pooled connection and refuse further acquisitions
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        self.slot_released.notify_waiters();
        let connections: Vec<Arc<Connection>> = self.pool.lock().await.drain(..).collect();
        info!(count = connections.len(), "Shutting down connection pool");
        join_all(connections.iter().map(|c| c.stop())).await;
        metrics::record_pool_status(0, 0);
    }
}
