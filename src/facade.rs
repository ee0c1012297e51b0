//! Access facade
//!
//! `DataLayer` is the single surface external collaborators call. It wires
//! the cache, optimizer, batch pipeline, monitor, and connection manager
//! together behind plain async operations that return the same shapes a
//! direct store call would.
//!
//! Lifecycle: `start()` connects, bootstraps indexes, and spawns the
//! background loops (cache sweep, connection health, trend check); `stop()`
//! signals shutdown and awaits every loop. Every operation fails fast with
//! `Error::NotStarted` before `start()` and `Error::StoreUnavailable` while
//! the health loop has the connection marked inactive.

use crate::aggregation::AggregationRunner;
use crate::batch::{bulk_write_chunked, BatchConfig, BatchProcessor};
use crate::cache::patterns::patterns_for_operation;
use crate::cache::{CacheStats, CachedValue, QueryCache};
use crate::config::AccessConfig;
use crate::error::{Error, Result};
use crate::monitor::{
    OperationSample, PerformanceMonitor, PerformanceReport, Recommendation,
};
use crate::optimizer::{explain, OptimizedQuery, QueryOptimizer};
use crate::services::PeriodicTask;
use crate::store::{CollectionIndexes, ConnectionManager, DocumentStore, DEFAULT_INDEX_PLAN};
use crate::types::{
    BatchOperation, BulkSummary, ExplainReport, FindOptions, QueryShape, ReadOperation,
    WriteOutcome,
};
use bson::Document;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`DataLayer`]
///
/// The store handle must be injected; everything else falls back to
/// [`AccessConfig::default`].
pub struct DataLayerBuilder {
    store: Option<Arc<dyn DocumentStore>>,
    config: AccessConfig,
    index_plan: Option<Vec<CollectionIndexes>>,
}

impl DataLayerBuilder {
    /// Empty builder
    pub fn new() -> Self {
        Self {
            store: None,
            config: AccessConfig::default(),
            index_plan: None,
        }
    }

    /// Set the store implementation
    pub fn with_store<S>(mut self, store: S) -> Self
    where
        S: DocumentStore,
    {
        self.store = Some(Arc::new(store));
        self
    }

    /// Set the store implementation from an existing handle
    ///
    /// Use this when the caller needs to retain direct access to the store,
    /// for example to inject faults in tests.
    pub fn with_store_arc(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the configuration
    pub fn with_config(mut self, config: AccessConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default index plan bootstrapped at startup
    pub fn with_index_plan(mut self, plan: Vec<CollectionIndexes>) -> Self {
        self.index_plan = Some(plan);
        self
    }

    /// Assemble the layer; `start()` performs the actual IO
    pub fn build(self) -> Result<DataLayer> {
        let store = self
            .store
            .ok_or_else(|| Error::Configuration("no document store configured".to_string()))?;
        self.config.validate().map_err(Error::Configuration)?;

        Ok(DataLayer {
            connection: Arc::new(ConnectionManager::new(
                Arc::clone(&store),
                self.config.connection_config(),
            )),
            cache: Arc::new(QueryCache::new(self.config.cache_config())),
            optimizer: QueryOptimizer::new(self.config.optimizer_config()),
            monitor: Arc::new(PerformanceMonitor::new(self.config.monitor_config())),
            runner: AggregationRunner::new(store, self.config.aggregation_config()),
            batch_config: self.config.batch_config(),
            index_plan: self.index_plan,
            started: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

impl Default for DataLayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Facade
// ============================================================================

/// Intelligent access layer over a document store
pub struct DataLayer {
    connection: Arc<ConnectionManager>,
    cache: Arc<QueryCache>,
    optimizer: QueryOptimizer,
    monitor: Arc<PerformanceMonitor>,
    runner: AggregationRunner,
    batch_config: BatchConfig,
    index_plan: Option<Vec<CollectionIndexes>>,
    started: AtomicBool,
    shutdown: Mutex<Option<broadcast::Sender<()>>>,
    tasks: Mutex<Vec<PeriodicTask>>,
}

impl std::fmt::Debug for DataLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLayer")
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl DataLayer {
    /// Start building a layer
    pub fn builder() -> DataLayerBuilder {
        DataLayerBuilder::new()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connect, bootstrap indexes, and spawn the background loops
    ///
    /// Starting an already-started layer is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("data layer already started");
            return Ok(());
        }

        let plan = self
            .index_plan
            .as_deref()
            .unwrap_or(DEFAULT_INDEX_PLAN.as_slice());
        if let Err(e) = self.connection.initialize(plan).await {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let (tx, _) = broadcast::channel(1);

        let cache = Arc::clone(&self.cache);
        let sweep = PeriodicTask::spawn(
            "cache-sweep",
            self.cache.sweep_interval(),
            tx.subscribe(),
            move || {
                let cache = Arc::clone(&cache);
                async move {
                    cache.sweep();
                }
            },
        );

        let connection = Arc::clone(&self.connection);
        let health = PeriodicTask::spawn(
            "connection-health",
            self.connection.health_check_interval(),
            tx.subscribe(),
            move || {
                let connection = Arc::clone(&connection);
                async move {
                    connection.health_check().await;
                }
            },
        );

        let monitor = Arc::clone(&self.monitor);
        let trends = PeriodicTask::spawn(
            "trend-check",
            self.monitor.trend_interval(),
            tx.subscribe(),
            move || {
                let monitor = Arc::clone(&monitor);
                async move {
                    let _ = monitor.check_trends();
                }
            },
        );

        *self.shutdown.lock() = Some(tx);
        self.tasks.lock().extend([sweep, health, trends]);

        info!("data layer started");
        Ok(())
    }

    /// Signal shutdown and await every background loop
    ///
    /// Stopping a layer that never started is a no-op.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        let tasks: Vec<PeriodicTask> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.stop().await;
        }
        self.connection.deactivate();
        info!("data layer stopped");
    }

    fn ensure_started(&self) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(Error::NotStarted);
        }
        self.connection.ensure_active()
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Fetch a single document
    ///
    /// Consults the cache under the caller's original query shape, then
    /// optimizes the filter and asks the store on a miss.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let user = layer
    ///     .find_one("users", doc! { "user_id": 42 }, None)
    ///     .await?;
    /// ```
    pub async fn find_one(
        &self,
        collection: &str,
        filter: Document,
        projection: Option<Document>,
    ) -> Result<Option<Document>> {
        self.ensure_started()?;
        let started = Instant::now();

        let mut shape = QueryShape::find_one(collection, filter.clone());
        shape.projection = projection.clone();
        if let Some(CachedValue::One(doc)) = self.cache.get(&shape) {
            self.monitor.record(
                OperationSample::new(collection, "find_one", filter)
                    .with_duration(started.elapsed())
                    .with_result_count(doc.is_some() as usize)
                    .from_cache(),
            );
            return Ok(doc);
        }

        let options = FindOptions {
            projection,
            ..FindOptions::default()
        };
        let optimized = self
            .optimizer
            .optimize(collection, ReadOperation::FindOne, filter.clone(), &options);
        self.log_rewrites(collection, &optimized);

        let result = self
            .connection
            .store()
            .find_one(collection, optimized.filter, optimized.projection)
            .await?;

        self.monitor.record(
            OperationSample::new(collection, "find_one", filter)
                .with_duration(started.elapsed())
                .with_result_count(result.is_some() as usize),
        );
        self.cache.set(&shape, CachedValue::One(result.clone()));
        Ok(result)
    }

    /// Fetch all documents matching `filter`, honoring `options`
    pub async fn find_many(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
    ) -> Result<Vec<Document>> {
        self.ensure_started()?;
        let started = Instant::now();

        let shape = QueryShape::find(collection, filter.clone(), &options);
        if let Some(CachedValue::Many(rows)) = self.cache.get(&shape) {
            self.monitor.record(
                OperationSample::new(collection, "find", filter)
                    .with_duration(started.elapsed())
                    .with_result_count(rows.len())
                    .from_cache(),
            );
            return Ok(rows);
        }

        let optimized =
            self.optimizer
                .optimize(collection, ReadOperation::Find, filter.clone(), &options);
        self.log_rewrites(collection, &optimized);
        let OptimizedQuery {
            filter: store_filter,
            projection,
            sort,
            hint,
            ..
        } = optimized;
        let store_options = FindOptions {
            projection,
            sort,
            limit: options.limit,
            skip: options.skip,
            hint,
        };

        let rows = self
            .connection
            .store()
            .find(collection, store_filter, &store_options)
            .await?;

        self.monitor.record(
            OperationSample::new(collection, "find", filter)
                .with_duration(started.elapsed())
                .with_result_count(rows.len()),
        );
        self.cache.set(&shape, CachedValue::Many(rows.clone()));
        Ok(rows)
    }

    /// Count documents matching `filter`
    pub async fn count_documents(&self, collection: &str, filter: Document) -> Result<u64> {
        self.ensure_started()?;
        let started = Instant::now();

        let shape = QueryShape::count(collection, filter.clone());
        if let Some(CachedValue::Count(n)) = self.cache.get(&shape) {
            self.monitor.record(
                OperationSample::new(collection, "count", filter)
                    .with_duration(started.elapsed())
                    .with_result_count(n as usize)
                    .from_cache(),
            );
            return Ok(n);
        }

        let optimized = self.optimizer.optimize(
            collection,
            ReadOperation::Count,
            filter.clone(),
            &FindOptions::default(),
        );
        self.log_rewrites(collection, &optimized);

        let n = self
            .connection
            .store()
            .count(collection, optimized.filter)
            .await?;

        self.monitor.record(
            OperationSample::new(collection, "count", filter)
                .with_duration(started.elapsed())
                .with_result_count(n as usize),
        );
        self.cache.set(&shape, CachedValue::Count(n));
        Ok(n)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Update the first document matching `filter`, then invalidate
    pub async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> Result<WriteOutcome> {
        self.ensure_started()?;
        let started = Instant::now();

        let outcome = self
            .connection
            .store()
            .update_one(collection, filter.clone(), update.clone(), upsert)
            .await?;

        self.monitor.record(
            OperationSample::new(collection, "update_one", filter.clone())
                .with_duration(started.elapsed())
                .with_result_count(outcome.count() as usize),
        );
        let invalidated = self
            .cache
            .invalidate_for_write(collection, &filter, Some(&update));
        debug!(collection, invalidated, "write invalidation");
        Ok(outcome)
    }

    /// Update every document matching `filter`, then invalidate
    pub async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> Result<WriteOutcome> {
        self.ensure_started()?;
        let started = Instant::now();

        let outcome = self
            .connection
            .store()
            .update_many(collection, filter.clone(), update.clone())
            .await?;

        self.monitor.record(
            OperationSample::new(collection, "update_many", filter.clone())
                .with_duration(started.elapsed())
                .with_result_count(outcome.count() as usize),
        );
        let invalidated = self
            .cache
            .invalidate_for_write(collection, &filter, Some(&update));
        debug!(collection, invalidated, "write invalidation");
        Ok(outcome)
    }

    /// Insert documents as one chunked bulk submission
    pub async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<BulkSummary> {
        self.ensure_started()?;
        if documents.is_empty() {
            return Ok(BulkSummary::new());
        }
        let operations: Vec<BatchOperation> = documents
            .into_iter()
            .map(|document| BatchOperation::Insert { document })
            .collect();
        self.submit_bulk(collection, "insert_many", operations).await
    }

    /// Execute arbitrary write operations as one chunked bulk submission
    pub async fn bulk_write(
        &self,
        collection: &str,
        operations: Vec<BatchOperation>,
    ) -> Result<BulkSummary> {
        self.ensure_started()?;
        if operations.is_empty() {
            return Ok(BulkSummary::new());
        }
        self.submit_bulk(collection, "bulk_write", operations).await
    }

    async fn submit_bulk(
        &self,
        collection: &str,
        operation: &str,
        operations: Vec<BatchOperation>,
    ) -> Result<BulkSummary> {
        let started = Instant::now();
        let store = self.connection.store();
        let summary =
            bulk_write_chunked(&store, collection, &operations, self.batch_config.chunk_limit)
                .await?;

        self.monitor.record(
            OperationSample::new(collection, operation, Document::new())
                .with_duration(started.elapsed())
                .with_result_count(summary.total_applied() as usize),
        );

        let mut patterns = std::collections::BTreeSet::new();
        for op in &operations {
            patterns.extend(patterns_for_operation(collection, op));
        }
        let invalidated = self.cache.invalidate_patterns(&patterns);
        debug!(
            collection,
            operations = operations.len(),
            applied = summary.total_applied(),
            failed = summary.failed,
            invalidated,
            "bulk submission finished"
        );
        Ok(summary)
    }

    /// Batch processor bound to `collection`, sharing this layer's cache
    /// and monitor
    pub fn create_batch_processor(&self, collection: &str) -> Result<BatchProcessor> {
        self.ensure_started()?;
        Ok(BatchProcessor::new(
            collection,
            self.batch_config.clone(),
            self.connection.store(),
            Arc::clone(&self.cache),
            Arc::clone(&self.monitor),
        ))
    }

    // ========================================================================
    // Aggregation
    // ========================================================================

    /// Run an aggregation pipeline under the configured bounds
    ///
    /// Results are cached only when `cache_ttl` is given; aggregations have
    /// no class-based TTL of their own.
    pub async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
        cache_ttl: Option<Duration>,
    ) -> Result<Vec<Document>> {
        self.ensure_started()?;
        let started = Instant::now();

        let shape = cache_ttl.map(|_| QueryShape::aggregate(collection, &pipeline));
        if let Some(shape) = &shape {
            if let Some(CachedValue::Many(rows)) = self.cache.get(shape) {
                self.monitor.record(
                    OperationSample::new(collection, "aggregate", Document::new())
                        .with_duration(started.elapsed())
                        .with_result_count(rows.len())
                        .from_cache(),
                );
                return Ok(rows);
            }
        }

        let rows = self.runner.execute(collection, pipeline, None).await?;

        self.monitor.record(
            OperationSample::new(collection, "aggregate", Document::new())
                .with_duration(started.elapsed())
                .with_result_count(rows.len()),
        );
        if let (Some(shape), Some(ttl)) = (&shape, cache_ttl) {
            self.cache
                .set_with_ttl(shape, CachedValue::Many(rows.clone()), ttl);
        }
        Ok(rows)
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Ask the store how it would execute a find, after optimization
    ///
    /// Probe failures and timeouts are logged and swallowed; the result
    /// feeds the monitor's index-usage statistics.
    pub async fn explain_query(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
    ) -> Result<Option<ExplainReport>> {
        self.ensure_started()?;
        let started = Instant::now();

        let optimized =
            self.optimizer
                .optimize(collection, ReadOperation::Find, filter.clone(), &options);
        let OptimizedQuery {
            filter: store_filter,
            projection,
            sort,
            hint,
            ..
        } = optimized;
        let probe_options = FindOptions {
            projection,
            sort,
            limit: options.limit,
            skip: options.skip,
            hint,
        };

        let store = self.connection.store();
        let report = explain::probe(&store, collection, store_filter, &probe_options).await;

        if let Some(report) = &report {
            self.monitor.record(
                OperationSample::new(collection, "explain", filter)
                    .with_duration(started.elapsed())
                    .with_result_count(report.docs_returned as usize)
                    .with_explain(report.clone()),
            );
        }
        Ok(report)
    }

    /// Cache occupancy and hit/miss counters
    pub fn cache_stats(&self) -> Result<CacheStats> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(Error::NotStarted);
        }
        Ok(self.cache.stats())
    }

    /// Drop every cached entry, returning how many were removed
    pub fn clear_cache(&self) -> Result<usize> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(Error::NotStarted);
        }
        Ok(self.cache.clear())
    }

    /// Snapshot of the monitor's statistics and alerts
    pub fn performance_report(&self) -> Result<PerformanceReport> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(Error::NotStarted);
        }
        Ok(self.monitor.report())
    }

    /// Index and cache recommendations derived from recorded history
    pub fn optimization_recommendations(&self) -> Result<Vec<Recommendation>> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(Error::NotStarted);
        }
        Ok(self.monitor.recommendations())
    }

    fn log_rewrites(&self, collection: &str, optimized: &OptimizedQuery) {
        if !optimized.applied.is_empty() {
            debug!(
                collection,
                rewrites = optimized.applied.len(),
                "query optimized"
            );
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
