//! Shared store connection lifecycle
//!
//! `ConnectionManager` owns the one `Arc<dyn DocumentStore>` the whole layer
//! shares. `initialize()` verifies liveness and bootstraps indexes; the
//! facade's health loop then calls `health_check()` on an interval. A failed
//! probe marks the connection inactive so every caller fails fast, and a
//! connection-shaped failure triggers a reconnect with jittered exponential
//! backoff between attempts.

use crate::error::{Error, Result, StoreError};
use crate::store::indexes::{ensure_indexes, CollectionIndexes, IndexBootstrapReport};
use crate::store::traits::DocumentStore;
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Backoff policy for reconnect attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum reconnect attempts per recovery cycle
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Ceiling on any single delay
    pub max_delay: Duration,
    /// Exponential growth factor
    pub multiplier: f64,
    /// Jitter fraction applied to each delay (0.25 = ±25%)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), with jitter applied
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.as_millis() as f64 * self.multiplier.powi(exp as i32);
        let capped = raw.min(self.max_delay.as_millis() as f64);
        let jitter = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        Duration::from_millis((capped * (1.0 + jitter)).max(0.0) as u64)
    }

    /// Validate the policy
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_retries == 0 {
            return Err("max_retries must be at least 1".to_string());
        }
        if self.base_delay > self.max_delay {
            return Err("base_delay must not exceed max_delay".to_string());
        }
        if self.multiplier < 1.0 {
            return Err("multiplier must be at least 1.0".to_string());
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err("jitter must be in [0, 1)".to_string());
        }
        Ok(())
    }
}

/// Connection manager configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Interval between liveness probes
    pub health_check_interval: Duration,
    /// Reconnect backoff policy
    pub retry: RetryPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    /// Set the health-check interval
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.health_check_interval < Duration::from_millis(1) {
            return Err("health_check_interval must be positive".to_string());
        }
        self.retry.validate()
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Lifecycle counters
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Successful liveness probes
    pub health_checks: AtomicU64,
    /// Failed liveness probes
    pub failed_health_checks: AtomicU64,
    /// Successful reconnects
    pub reconnects: AtomicU64,
    /// Recovery cycles that exhausted their retries
    pub reconnect_failures: AtomicU64,
}

/// Point-in-time view of [`ConnectionStats`]
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatsSnapshot {
    /// Successful liveness probes
    pub health_checks: u64,
    /// Failed liveness probes
    pub failed_health_checks: u64,
    /// Successful reconnects
    pub reconnects: u64,
    /// Recovery cycles that exhausted their retries
    pub reconnect_failures: u64,
}

impl ConnectionStats {
    fn snapshot(&self) -> ConnectionStatsSnapshot {
        ConnectionStatsSnapshot {
            health_checks: self.health_checks.load(Ordering::Relaxed),
            failed_health_checks: self.failed_health_checks.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            reconnect_failures: self.reconnect_failures.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Owns the shared store handle and its liveness state
pub struct ConnectionManager {
    store: Arc<dyn DocumentStore>,
    config: ConnectionConfig,
    active: AtomicBool,
    stats: ConnectionStats,
}

impl ConnectionManager {
    /// Wrap a store handle; starts inactive until `initialize()` succeeds
    pub fn new(store: Arc<dyn DocumentStore>, config: ConnectionConfig) -> Self {
        Self {
            store,
            config,
            active: AtomicBool::new(false),
            stats: ConnectionStats::default(),
        }
    }

    /// The shared store handle
    pub fn store(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.store)
    }

    /// Whether the connection is currently considered healthy
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// How often the owner should run `health_check`
    pub fn health_check_interval(&self) -> Duration {
        self.config.health_check_interval
    }

    /// Fail fast when the connection is marked inactive
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::StoreUnavailable {
                reason: "connection marked inactive by health check".to_string(),
            })
        }
    }

    /// Lifecycle counters
    pub fn stats(&self) -> ConnectionStatsSnapshot {
        self.stats.snapshot()
    }

    /// Verify liveness, mark the connection active, and bootstrap indexes
    ///
    /// The initial ping retries on the configured policy; index bootstrap
    /// failures are logged and swallowed.
    pub async fn initialize(&self, plan: &[CollectionIndexes]) -> Result<IndexBootstrapReport> {
        self.ping_with_retry().await?;
        self.active.store(true, Ordering::SeqCst);
        info!("store connection established");
        let report = ensure_indexes(&self.store, plan).await;
        if !report.created.is_empty() || report.failed > 0 {
            info!(
                created = report.created.len(),
                existing = report.existing,
                failed = report.failed,
                "index bootstrap finished"
            );
        }
        Ok(report)
    }

    /// One liveness probe; reconnects when the failure looks like a dropped
    /// connection
    pub async fn health_check(&self) {
        match self.store.ping().await {
            Ok(()) => {
                self.stats.health_checks.fetch_add(1, Ordering::Relaxed);
                if !self.is_active() {
                    info!("store connection recovered");
                }
                self.active.store(true, Ordering::SeqCst);
            }
            Err(e) => {
                self.stats
                    .failed_health_checks
                    .fetch_add(1, Ordering::Relaxed);
                self.active.store(false, Ordering::SeqCst);
                warn!(error = %e, "health check failed, connection marked inactive");
                if e.is_connection_loss() {
                    self.reconnect().await;
                }
            }
        }
    }

    /// Mark the connection inactive; issued on shutdown
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    async fn ping_with_retry(&self) -> Result<()> {
        let mut last: Option<StoreError> = None;
        for attempt in 0..=self.config.retry.max_retries {
            if attempt > 0 {
                let delay = self.config.retry.delay_for_attempt(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying store ping");
                tokio::time::sleep(delay).await;
            }
            match self.store.ping().await {
                Ok(()) => return Ok(()),
                Err(e) => last = Some(e),
            }
        }
        Err(Error::Store(last.unwrap_or_else(|| {
            StoreError::Internal("ping retry loop yielded no error".to_string())
        })))
    }

    async fn reconnect(&self) -> bool {
        for attempt in 1..=self.config.retry.max_retries {
            let delay = self.config.retry.delay_for_attempt(attempt);
            tokio::time::sleep(delay).await;
            match self.store.ping().await {
                Ok(()) => {
                    self.active.store(true, Ordering::SeqCst);
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    info!(attempt, "store connection reestablished");
                    return true;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                }
            }
        }
        self.stats.reconnect_failures.fetch_add(1, Ordering::Relaxed);
        warn!(
            attempts = self.config.retry.max_retries,
            "reconnect attempts exhausted, connection stays inactive"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::indexes::DEFAULT_INDEX_PLAN;
    use crate::store::memory::MemoryStore;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    fn manager(store: Arc<MemoryStore>) -> ConnectionManager {
        ConnectionManager::new(
            store,
            ConnectionConfig::default().with_retry(fast_retry()),
        )
    }

    #[test]
    fn test_retry_delay_growth_and_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(350));
    }

    #[test]
    fn test_retry_jitter_bounds() {
        let policy = RetryPolicy {
            jitter: 0.25,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let d = policy.delay_for_attempt(1).as_millis() as f64;
            assert!((150.0..=250.0).contains(&d), "delay {} out of bounds", d);
        }
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        let bad = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        assert!(bad.validate().is_err());
        let inverted = RetryPolicy {
            base_delay: Duration::from_secs(60),
            ..RetryPolicy::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[tokio::test]
    async fn test_initialize_marks_active_and_bootstraps() {
        let store = Arc::new(MemoryStore::new());
        let mgr = manager(Arc::clone(&store));
        assert!(!mgr.is_active());
        assert!(mgr.ensure_active().is_err());

        let report = mgr.initialize(&DEFAULT_INDEX_PLAN).await.unwrap();
        assert!(mgr.is_active());
        assert!(mgr.ensure_active().is_ok());
        assert!(!report.created.is_empty());
    }

    #[tokio::test]
    async fn test_initialize_fails_when_store_down() {
        let store = Arc::new(MemoryStore::new());
        store.set_offline(true);
        let mgr = manager(Arc::clone(&store));
        let err = mgr.initialize(&DEFAULT_INDEX_PLAN).await.unwrap_err();
        assert!(matches!(err, Error::Store(ref s) if s.is_connection_loss()));
        assert!(!mgr.is_active());
    }

    #[tokio::test]
    async fn test_health_check_reconnects_after_transient_loss() {
        let store = Arc::new(MemoryStore::new());
        let mgr = manager(Arc::clone(&store));
        mgr.initialize(&[]).await.unwrap();

        // One probe fails with a connection-shaped error; the store is healthy
        // again by the time the reconnect loop pings.
        store.fail_next(StoreError::ConnectionLost("reset by peer".to_string()));
        mgr.health_check().await;
        assert!(mgr.is_active());
        let stats = mgr.stats();
        assert_eq!(stats.failed_health_checks, 1);
        assert_eq!(stats.reconnects, 1);
    }

    #[tokio::test]
    async fn test_health_check_stays_inactive_while_offline() {
        let store = Arc::new(MemoryStore::new());
        let mgr = manager(Arc::clone(&store));
        mgr.initialize(&[]).await.unwrap();

        store.set_offline(true);
        mgr.health_check().await;
        assert!(!mgr.is_active());
        assert_eq!(mgr.stats().reconnect_failures, 1);

        store.set_offline(false);
        mgr.health_check().await;
        assert!(mgr.is_active());
    }

    #[tokio::test]
    async fn test_non_connection_failure_skips_reconnect() {
        let store = Arc::new(MemoryStore::new());
        let mgr = manager(Arc::clone(&store));
        mgr.initialize(&[]).await.unwrap();

        store.fail_next(StoreError::Internal("scrambled".to_string()));
        mgr.health_check().await;
        assert!(!mgr.is_active());
        assert_eq!(mgr.stats().reconnects, 0);

        mgr.health_check().await;
        assert!(mgr.is_active());
    }
}
