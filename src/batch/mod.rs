//! Batched bulk-write pipeline
//!
//! `BatchProcessor` accumulates write operations for one collection and
//! submits them as chunked bulk commands when a size threshold, an idle
//! timeout, or an explicit flush says so. Mutating methods take `&mut self`,
//! which statically enforces the single-producer contract; callers that
//! share a processor wrap it in their own lock.
//!
//! After a flush the processor invalidates intersecting cache entries and
//! records the batch with the performance monitor. Partial bulk failures
//! come back inside the summary; only store-level failures raise errors,
//! and `execute_batch` restores the queue so a retry resubmits the same
//! operations.

use crate::cache::patterns::patterns_for_operation;
use crate::cache::QueryCache;
use crate::error::{BatchError, Error, Result, StoreError};
use crate::monitor::{OperationSample, PerformanceMonitor};
use crate::store::traits::DocumentStore;
use crate::types::{BatchOperation, BulkSummary};
use bson::Document;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Batch pipeline tuning knobs
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Pending count that makes a batch ready
    pub batch_size: usize,
    /// Idle time after which pending operations flush on the next poll
    pub flush_idle: Duration,
    /// Hard upper bound on operations per bulk command
    pub chunk_limit: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_idle: Duration::from_secs(30),
            chunk_limit: 100,
        }
    }
}

impl BatchConfig {
    /// Set the readiness threshold
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the idle flush timeout
    pub fn with_flush_idle(mut self, flush_idle: Duration) -> Self {
        self.flush_idle = flush_idle;
        self
    }

    /// Set the per-command chunk limit
    pub fn with_chunk_limit(mut self, chunk_limit: usize) -> Self {
        self.chunk_limit = chunk_limit;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be at least 1".to_string());
        }
        if self.chunk_limit == 0 {
            return Err("chunk_limit must be at least 1".to_string());
        }
        if self.flush_idle.is_zero() {
            return Err("flush_idle must be positive".to_string());
        }
        Ok(())
    }
}

/// Counters for one processor
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    /// Inserts enqueued
    pub inserts: u64,
    /// Updates enqueued
    pub updates: u64,
    /// Deletes enqueued
    pub deletes: u64,
    /// Replaces enqueued
    pub replaces: u64,
    /// Batches submitted successfully
    pub batches_executed: u64,
    /// Operations submitted across all batches
    pub operations_flushed: u64,
    /// Per-operation failures reported inside summaries
    pub failed_operations: u64,
    /// Store-level errors (whole batch rejected)
    pub errors: u64,
    /// Operations currently queued
    pub pending: usize,
}

// ============================================================================
// Chunked submission
// ============================================================================

/// Submit operations as sequential chunks and fold the summaries
///
/// Error indices in the folded summary are offset back into the caller's
/// operation list. A store-level error aborts remaining chunks; already
/// applied chunks stay applied.
pub(crate) async fn bulk_write_chunked(
    store: &Arc<dyn DocumentStore>,
    collection: &str,
    operations: &[BatchOperation],
    chunk_limit: usize,
) -> std::result::Result<BulkSummary, StoreError> {
    let mut summary = BulkSummary::new();
    for (i, chunk) in operations.chunks(chunk_limit).enumerate() {
        let part = store.bulk_write(collection, chunk).await?;
        summary.merge(part, i * chunk_limit);
    }
    Ok(summary)
}

// ============================================================================
// Processor
// ============================================================================

/// Accumulates writes for one collection and flushes them in bulk
pub struct BatchProcessor {
    collection: String,
    config: BatchConfig,
    store: Arc<dyn DocumentStore>,
    cache: Arc<QueryCache>,
    monitor: Arc<PerformanceMonitor>,
    queue: Vec<BatchOperation>,
    last_flush: Instant,
    stats: BatchStats,
}

impl BatchProcessor {
    pub(crate) fn new(
        collection: impl Into<String>,
        config: BatchConfig,
        store: Arc<dyn DocumentStore>,
        cache: Arc<QueryCache>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        Self {
            collection: collection.into(),
            config,
            store,
            cache,
            monitor,
            queue: Vec::new(),
            last_flush: Instant::now(),
            stats: BatchStats::default(),
        }
    }

    /// Collection this processor writes to
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Queue an insert, returning the pending count
    pub fn add_insert(&mut self, document: Document) -> usize {
        self.stats.inserts += 1;
        self.queue.push(BatchOperation::Insert { document });
        self.queue.len()
    }

    /// Queue a single-document update, returning the pending count
    pub fn add_update(&mut self, filter: Document, update: Document, upsert: bool) -> usize {
        self.stats.updates += 1;
        self.queue.push(BatchOperation::Update {
            filter,
            update,
            upsert,
            many: false,
        });
        self.queue.len()
    }

    /// Queue a single-document delete, returning the pending count
    pub fn add_delete(&mut self, filter: Document) -> usize {
        self.stats.deletes += 1;
        self.queue.push(BatchOperation::Delete {
            filter,
            many: false,
        });
        self.queue.len()
    }

    /// Queue a replace, returning the pending count
    pub fn add_replace(&mut self, filter: Document, replacement: Document, upsert: bool) -> usize {
        self.stats.replaces += 1;
        self.queue.push(BatchOperation::Replace {
            filter,
            replacement,
            upsert,
        });
        self.queue.len()
    }

    /// Whether pending operations have reached the batch size
    pub fn is_ready(&self) -> bool {
        self.queue.len() >= self.config.batch_size
    }

    /// Operations currently queued
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Counters plus current queue depth
    pub fn stats(&self) -> BatchStats {
        let mut stats = self.stats.clone();
        stats.pending = self.queue.len();
        stats
    }

    /// Flush if the batch is due
    ///
    /// Due means: forced, the size threshold is met, or pending operations
    /// have sat past the idle timeout since the last successful flush.
    /// Returns `None` when nothing was due. On a store-level error the
    /// drained operations are restored, so a retry resubmits exactly the
    /// same batch.
    pub async fn execute_batch(&mut self, force: bool) -> Result<Option<(BulkSummary, usize)>> {
        if self.queue.is_empty() {
            return Ok(None);
        }
        let idle = self.last_flush.elapsed() >= self.config.flush_idle;
        if !force && !self.is_ready() && !idle {
            return Ok(None);
        }
        let operations = std::mem::take(&mut self.queue);
        let count = operations.len();
        let started = Instant::now();
        match bulk_write_chunked(&self.store, &self.collection, &operations, self.config.chunk_limit)
            .await
        {
            Ok(summary) => {
                self.note_flush(&operations, &summary, started.elapsed());
                Ok(Some((summary, count)))
            }
            Err(source) => {
                self.stats.errors += 1;
                self.queue = operations;
                warn!(
                    collection = %self.collection,
                    restored = count,
                    error = %source,
                    "batch execution failed, queue restored"
                );
                Err(Error::Batch(BatchError::ExecutionFailed {
                    restored: count,
                    source,
                }))
            }
        }
    }

    /// Force execution and leave the queue empty even on failure
    pub async fn flush(&mut self) -> Result<Option<(BulkSummary, usize)>> {
        if self.queue.is_empty() {
            return Ok(None);
        }
        let operations = std::mem::take(&mut self.queue);
        let count = operations.len();
        let started = Instant::now();
        match bulk_write_chunked(&self.store, &self.collection, &operations, self.config.chunk_limit)
            .await
        {
            Ok(summary) => {
                self.note_flush(&operations, &summary, started.elapsed());
                Ok(Some((summary, count)))
            }
            Err(source) => {
                self.stats.errors += 1;
                warn!(
                    collection = %self.collection,
                    dropped = count,
                    error = %source,
                    "flush failed, operations dropped"
                );
                Err(Error::Batch(BatchError::FlushFailed {
                    dropped: count,
                    source,
                }))
            }
        }
    }

    fn note_flush(&mut self, operations: &[BatchOperation], summary: &BulkSummary, elapsed: Duration) {
        self.last_flush = Instant::now();
        self.stats.batches_executed += 1;
        self.stats.operations_flushed += operations.len() as u64;
        self.stats.failed_operations += summary.failed;

        let mut patterns = BTreeSet::new();
        for op in operations {
            patterns.extend(patterns_for_operation(&self.collection, op));
        }
        let invalidated = self.cache.invalidate_patterns(&patterns);

        self.monitor.record(
            OperationSample::new(self.collection.clone(), "bulk_write", Document::new())
                .with_duration(elapsed)
                .with_result_count(summary.total_applied() as usize),
        );

        debug!(
            collection = %self.collection,
            operations = operations.len(),
            applied = summary.total_applied(),
            failed = summary.failed,
            invalidated,
            "batch flushed"
        );
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CachedValue};
    use crate::monitor::MonitorConfig;
    use crate::store::memory::MemoryStore;
    use crate::types::QueryShape;
    use bson::doc;
    use std::sync::atomic::Ordering;

    fn processor(store: Arc<MemoryStore>, config: BatchConfig) -> BatchProcessor {
        BatchProcessor::new(
            "users",
            config,
            store,
            Arc::new(QueryCache::new(CacheConfig::default())),
            Arc::new(PerformanceMonitor::new(MonitorConfig::default())),
        )
    }

    #[tokio::test]
    async fn test_adds_accumulate_without_submitting() {
        let store = Arc::new(MemoryStore::new());
        let mut batch = processor(store.clone(), BatchConfig::default());
        assert_eq!(batch.add_insert(doc! { "user_id": 1 }), 1);
        assert_eq!(batch.add_update(doc! { "user_id": 2 }, doc! { "$set": { "a": 1 } }, false), 2);
        assert_eq!(batch.add_delete(doc! { "user_id": 3 }), 3);
        assert_eq!(store.counters.bulk_writes.load(Ordering::Relaxed), 0);
        assert!(!batch.is_ready());
        assert_eq!(batch.stats().pending, 3);
    }

    #[tokio::test]
    async fn test_not_due_returns_none() {
        let store = Arc::new(MemoryStore::new());
        let mut batch = processor(store.clone(), BatchConfig::default());
        batch.add_insert(doc! { "user_id": 1 });
        let result = batch.execute_batch(false).await.unwrap();
        assert!(result.is_none());
        assert_eq!(batch.pending(), 1);
        assert_eq!(store.counters.bulk_writes.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_threshold_triggers_single_command() {
        let store = Arc::new(MemoryStore::new());
        let config = BatchConfig::default().with_batch_size(3);
        let mut batch = processor(store.clone(), config);
        for i in 0..3 {
            batch.add_insert(doc! { "user_id": i });
        }
        assert!(batch.is_ready());
        let (summary, count) = batch.execute_batch(false).await.unwrap().unwrap();
        assert_eq!(count, 3);
        assert_eq!(summary.inserted, 3);
        assert_eq!(batch.pending(), 0);
        assert_eq!(store.counters.bulk_writes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_force_flushes_below_threshold() {
        let store = Arc::new(MemoryStore::new());
        let mut batch = processor(store.clone(), BatchConfig::default());
        batch.add_insert(doc! { "user_id": 1 });
        let (summary, count) = batch.execute_batch(true).await.unwrap().unwrap();
        assert_eq!(count, 1);
        assert_eq!(summary.inserted, 1);
    }

    #[tokio::test]
    async fn test_idle_timeout_triggers() {
        let store = Arc::new(MemoryStore::new());
        let config = BatchConfig::default().with_flush_idle(Duration::from_millis(40));
        let mut batch = processor(store.clone(), config);
        batch.add_insert(doc! { "user_id": 1 });
        assert!(batch.execute_batch(false).await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(60)).await;
        let flushed = batch.execute_batch(false).await.unwrap();
        assert!(flushed.is_some());
        assert_eq!(batch.pending(), 0);
    }

    #[tokio::test]
    async fn test_large_batch_chunked() {
        let store = Arc::new(MemoryStore::new());
        let config = BatchConfig::default().with_batch_size(250);
        let mut batch = processor(store.clone(), config);
        for i in 0..250 {
            batch.add_insert(doc! { "user_id": i });
        }
        let (summary, count) = batch.execute_batch(false).await.unwrap().unwrap();
        assert_eq!(count, 250);
        assert_eq!(summary.inserted, 250);
        assert_eq!(store.counters.bulk_writes.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_failed_execution_restores_queue() {
        let store = Arc::new(MemoryStore::new());
        let mut batch = processor(store.clone(), BatchConfig::default());
        batch.add_insert(doc! { "user_id": 1 });
        batch.add_insert(doc! { "user_id": 2 });
        store.fail_next(StoreError::ConnectionLost("socket closed".to_string()));
        let err = batch.execute_batch(true).await.unwrap_err();
        match err {
            Error::Batch(BatchError::ExecutionFailed { restored, .. }) => assert_eq!(restored, 2),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(batch.pending(), 2);

        // retry resubmits the same operations
        let (summary, count) = batch.execute_batch(true).await.unwrap().unwrap();
        assert_eq!(count, 2);
        assert_eq!(summary.inserted, 2);
        assert_eq!(batch.pending(), 0);
    }

    #[tokio::test]
    async fn test_flush_clears_queue_on_failure() {
        let store = Arc::new(MemoryStore::new());
        let mut batch = processor(store.clone(), BatchConfig::default());
        batch.add_insert(doc! { "user_id": 1 });
        store.fail_next(StoreError::ConnectionLost("socket closed".to_string()));
        let err = batch.flush().await.unwrap_err();
        match err {
            Error::Batch(BatchError::FlushFailed { dropped, .. }) => assert_eq!(dropped, 1),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(batch.pending(), 0);
    }

    #[tokio::test]
    async fn test_partial_failure_reported_in_summary() {
        let store = Arc::new(MemoryStore::new());
        let mut batch = processor(store.clone(), BatchConfig::default());
        batch.add_insert(doc! { "_id": 1, "user_id": 1 });
        batch.add_insert(doc! { "_id": 1, "user_id": 2 });
        batch.add_insert(doc! { "_id": 2, "user_id": 3 });
        let (summary, count) = batch.execute_batch(true).await.unwrap().unwrap();
        assert_eq!(count, 3);
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors[0].index, 1);
        assert_eq!(summary.errors[0].code, Some(11_000));
        assert_eq!(batch.stats().failed_operations, 1);
    }

    #[tokio::test]
    async fn test_flush_invalidates_matching_cache_entries() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(QueryCache::new(CacheConfig::default()));
        let monitor = Arc::new(PerformanceMonitor::new(MonitorConfig::default()));
        let mut batch = BatchProcessor::new(
            "users",
            BatchConfig::default(),
            store.clone(),
            cache.clone(),
            monitor.clone(),
        );

        let seven = QueryShape::find_one("users", doc! { "user_id": 7 });
        let eight = QueryShape::find_one("users", doc! { "user_id": 8 });
        cache.set(&seven, CachedValue::One(Some(doc! { "user_id": 7 })));
        cache.set(&eight, CachedValue::One(Some(doc! { "user_id": 8 })));

        batch.add_update(doc! { "user_id": 7 }, doc! { "$set": { "status": "away" } }, false);
        batch.flush().await.unwrap();

        assert!(cache.get(&seven).is_none());
        assert!(cache.get(&eight).is_some());
        assert_eq!(monitor.total_operations(), 1);
    }

    #[tokio::test]
    async fn test_stats_track_operation_kinds() {
        let store = Arc::new(MemoryStore::new());
        let mut batch = processor(store.clone(), BatchConfig::default());
        batch.add_insert(doc! { "user_id": 1 });
        batch.add_insert(doc! { "user_id": 2 });
        batch.add_update(doc! { "user_id": 1 }, doc! { "$set": { "a": 1 } }, false);
        batch.add_delete(doc! { "user_id": 2 });
        batch.add_replace(doc! { "user_id": 1 }, doc! { "user_id": 1, "fresh": true }, false);
        batch.execute_batch(true).await.unwrap();

        let stats = batch.stats();
        assert_eq!(stats.inserts, 2);
        assert_eq!(stats.updates, 1);
        assert_eq!(stats.deletes, 1);
        assert_eq!(stats.replaces, 1);
        assert_eq!(stats.batches_executed, 1);
        assert_eq!(stats.operations_flushed, 5);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn test_config_validation() {
        assert!(BatchConfig::default().validate().is_ok());
        assert!(BatchConfig::default().with_batch_size(0).validate().is_err());
        assert!(BatchConfig::default().with_chunk_limit(0).validate().is_err());
        assert!(BatchConfig::default()
            .with_flush_idle(Duration::ZERO)
            .validate()
            .is_err());
    }
}
