//! Storage gateway
//!
//! Owns the one connection pool every component shares. All reads and writes
//! go through [`StorageGateway::query`] or [`StorageGateway::with_transaction`],
//! which retry transient failures and re-establish the pool once per operation
//! when the connection itself was lost.
//!
//! A background health monitor pings the database and runs the repair routine
//! on failure. Repair swaps a freshly built pool in under the lock; callers pick
//! it up on their next operation since nothing holds a pool across calls.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use market_common::error::{DatabaseError, ErrorClassification};
use parking_lot::RwLock;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::{StorageError, StorageResult};
use crate::config::{DatabaseSettings, GatewaySettings};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds connection pools. The gateway calls this on startup and on every repair.
#[async_trait]
pub trait PoolConnector: Send + Sync {
    async fn connect(&self) -> Result<PgPool, DatabaseError>;
}

/// Connector for a PostgreSQL URL
pub struct PgConnector {
    settings: DatabaseSettings,
    lazy: bool,
}

impl PgConnector {
    /// Connects eagerly, failing fast if the database is unreachable
    pub fn new(settings: DatabaseSettings) -> Self {
        Self {
            settings,
            lazy: false,
        }
    }

    /// Defers connecting until the first query
    pub fn lazy(settings: DatabaseSettings) -> Self {
        Self {
            settings,
            lazy: true,
        }
    }
}

#[async_trait]
impl PoolConnector for PgConnector {
    async fn connect(&self) -> Result<PgPool, DatabaseError> {
        let options = PgPoolOptions::new()
            .max_connections(self.settings.max_connections)
            .acquire_timeout(Duration::from_secs(self.settings.acquire_timeout_secs));

        let pool = if self.lazy {
            options.min_connections(0).connect_lazy(&self.settings.url)?
        } else {
            options
                .min_connections(self.settings.min_connections)
                .connect(&self.settings.url)
                .await?
        };

        Ok(pool)
    }
}

/// Clears the repair flag when the repair routine exits by any path.
struct RepairGuard<'a>(&'a AtomicBool);

impl Drop for RepairGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Pooled, retrying access to the relational store
pub struct StorageGateway {
    connector: Arc<dyn PoolConnector>,
    config: GatewaySettings,
    pool: RwLock<Option<PgPool>>,
    /// Bumped on every pool swap
    generation: AtomicU64,
    repairing: AtomicBool,
    /// Consecutive failed reconnects; reset on success
    reconnect_attempts: AtomicU32,
    repairs: AtomicU64,
}

impl StorageGateway {
    pub fn new(connector: Arc<dyn PoolConnector>, config: GatewaySettings) -> Self {
        Self {
            connector,
            config,
            pool: RwLock::new(None),
            generation: AtomicU64::new(0),
            repairing: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            repairs: AtomicU64::new(0),
        }
    }

    /// Gateway over a PostgreSQL URL. Call [`connect`](Self::connect) before use.
    pub fn postgres(database: &DatabaseSettings, config: GatewaySettings) -> Self {
        Self::new(Arc::new(PgConnector::new(database.clone())), config)
    }

    /// Create the initial pool
    pub async fn connect(&self) -> StorageResult<()> {
        let pool = self.connector.connect().await?;
        self.install(pool);
        info!(generation = self.generation(), "Storage pool connected");
        Ok(())
    }

    /// Swap in a new pool, returning the previous one.
    fn install(&self, pool: PgPool) -> Option<PgPool> {
        let previous = self.pool.write().replace(pool);
        self.generation.fetch_add(1, Ordering::SeqCst);
        previous
    }

    /// Current pool handle. Cloning a pool is cheap and shares connections.
    pub fn pool(&self) -> StorageResult<PgPool> {
        self.pool.read().clone().ok_or(StorageError::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.pool.read().is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn repair_count(&self) -> u64 {
        self.repairs.load(Ordering::Relaxed)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn is_repairing(&self) -> bool {
        self.repairing.load(Ordering::Acquire)
    }

    /// Run `operation` against the current pool, retrying transient failures.
    ///
    /// A missing pool is structural and returned immediately. On a transient
    /// error the gateway waits the fixed retry delay, repairs the pool once if
    /// the connection was lost, and tries again, up to `max_retries` attempts.
    pub async fn query<T, F, Fut>(&self, operation: F) -> StorageResult<T>
    where
        F: Fn(PgPool) -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 0;
        let mut reconnected = false;

        loop {
            attempt += 1;
            let pool = self.pool()?;

            let err = match operation(pool).await {
                Ok(value) => return Ok(value),
                Err(err) => StorageError::from(err),
            };

            if !err.is_transient() {
                return Err(err);
            }
            if attempt >= max_attempts {
                error!(attempts = attempt, error = %err, "Storage operation failed after retries");
                return Err(err);
            }

            warn!(
                attempt,
                max_attempts,
                error = %err,
                "Transient storage error, retrying"
            );
            tokio::time::sleep(self.config.retry_delay()).await;

            if err.is_connection_loss() && !reconnected {
                reconnected = true;
                self.repair().await;
            }
        }
    }

    /// Run `operation` inside one transaction with the same retry policy as
    /// [`query`](Self::query). A failed attempt rolls back before the retry.
    pub async fn with_transaction<T, F>(&self, operation: F) -> StorageResult<T>
    where
        F: for<'c> Fn(&'c mut Transaction<'static, Postgres>) -> BoxFuture<'c, Result<T, sqlx::Error>>,
    {
        self.query(|pool| {
            let operation = &operation;
            async move {
                let mut tx = pool.begin().await?;
                let value = operation(&mut tx).await?;
                tx.commit().await?;
                Ok(value)
            }
        })
        .await
    }

    /// Single round trip, no retry
    pub async fn health_check(&self) -> StorageResult<()> {
        let pool = self.pool()?;
        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, sqlx::query("SELECT 1").execute(&pool))
            .await
            .map_err(|_| DatabaseError::Timeout(HEALTH_CHECK_TIMEOUT))??;
        Ok(())
    }

    /// Close the current pool and build a new one.
    ///
    /// Only one repair runs at a time; a call made while another is in flight
    /// returns `false` without doing anything.
    pub async fn repair(&self) -> bool {
        if self
            .repairing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Storage repair already in progress");
            return false;
        }
        let _guard = RepairGuard(&self.repairing);

        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        info!(attempt, "Repairing storage connection pool");

        match self.connector.connect().await {
            Ok(pool) => {
                if let Some(previous) = self.install(pool) {
                    tokio::spawn(async move { previous.close().await });
                }
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                self.repairs.fetch_add(1, Ordering::Relaxed);
                info!(generation = self.generation(), "Storage pool re-established");
                true
            }
            Err(e) => {
                error!(
                    attempt,
                    error = %e,
                    next_check_in = ?self.next_check_delay(),
                    "Storage pool repair failed"
                );
                false
            }
        }
    }

    /// Delay before the next health check: the configured interval when healthy,
    /// otherwise doubling from the retry delay after each failed reconnect.
    pub fn next_check_delay(&self) -> Duration {
        let interval = self.config.health_check_interval();
        match self.reconnect_attempts() {
            0 => interval,
            failures => {
                let exponent = (failures - 1).min(16);
                let backoff = self.config.retry_delay().saturating_mul(1u32 << exponent);
                backoff.min(interval)
            }
        }
    }

    /// Spawn the periodic health check
    pub fn start_health_monitor(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_secs = gateway.config.health_check_interval_secs,
                "Storage health monitor started"
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(gateway.next_check_delay()) => {}
                    _ = shutdown.recv() => {
                        info!("Storage health monitor stopping");
                        break;
                    }
                }

                match gateway.health_check().await {
                    Ok(()) => debug!("Storage health check passed"),
                    Err(e) => {
                        warn!(error = %e, "Storage health check failed");
                        gateway.repair().await;
                    }
                }
            }
        })
    }

    /// Close the pool for shutdown. Later operations fail with `NotInitialized`.
    pub async fn close(&self) {
        let pool = self.pool.write().take();
        if let Some(pool) = pool {
            pool.close().await;
            info!("Storage pool closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn lazy_pool() -> PgPool {
        PgPoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_lazy("postgres://localhost:1/market_test")
            .unwrap()
    }

    #[derive(Default)]
    struct CountingConnector {
        connects: AtomicUsize,
        fail: AtomicBool,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl PoolConnector for CountingConnector {
        async fn connect(&self) -> Result<PgPool, DatabaseError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(DatabaseError::Connection("refused".to_string()));
            }
            Ok(lazy_pool())
        }
    }

    fn config() -> GatewaySettings {
        GatewaySettings {
            max_retries: 3,
            retry_delay_ms: 1000,
            health_check_interval_secs: 30,
        }
    }

    async fn connected(connector: Arc<CountingConnector>) -> StorageGateway {
        let gateway = StorageGateway::new(connector, config());
        gateway.connect().await.unwrap();
        gateway
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_reconnects_once_and_retries() {
        let connector = Arc::new(CountingConnector::default());
        let gateway = connected(connector.clone()).await;
        let calls = AtomicUsize::new(0);

        let result = gateway
            .query(|_pool| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(sqlx::Error::PoolClosed)
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Initial connect plus exactly one reconnect
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(gateway.generation(), 2);
        assert_eq!(gateway.repair_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_surfaces_error() {
        let connector = Arc::new(CountingConnector::default());
        let gateway = connected(connector).await;
        let calls = AtomicUsize::new(0);

        let result: StorageResult<()> = gateway
            .query(|_pool| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(sqlx::Error::PoolClosed) }
            })
            .await;

        assert!(result.unwrap_err().is_connection_loss());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let connector = Arc::new(CountingConnector::default());
        let gateway = connected(connector.clone()).await;
        let calls = AtomicUsize::new(0);

        let result: StorageResult<()> = gateway
            .query(|_pool| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(sqlx::Error::RowNotFound) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_uninitialized_pool_is_structural() {
        let gateway = StorageGateway::new(Arc::new(CountingConnector::default()), config());
        let calls = AtomicUsize::new(0);

        let result: StorageResult<()> = gateway
            .query(|_pool| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(StorageError::NotInitialized)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_repair_is_noop() {
        let gate = Arc::new(Notify::new());
        let connector = Arc::new(CountingConnector {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let gateway = Arc::new(StorageGateway::new(connector.clone(), config()));

        let first = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.repair().await })
        };
        while !gateway.is_repairing() {
            tokio::task::yield_now().await;
        }

        assert!(!gateway.repair().await);

        gate.notify_one();
        assert!(first.await.unwrap());
        assert!(!gateway.is_repairing());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_counter_resets_on_success() {
        let connector = Arc::new(CountingConnector::default());
        connector.fail.store(true, Ordering::SeqCst);
        let gateway = StorageGateway::new(connector.clone(), config());

        assert!(!gateway.repair().await);
        assert!(!gateway.repair().await);
        assert_eq!(gateway.reconnect_attempts(), 2);
        assert_eq!(gateway.next_check_delay(), Duration::from_secs(2));

        connector.fail.store(false, Ordering::SeqCst);
        assert!(gateway.repair().await);
        assert_eq!(gateway.reconnect_attempts(), 0);
        assert_eq!(gateway.next_check_delay(), Duration::from_secs(30));
        assert!(gateway.is_initialized());
    }
}
