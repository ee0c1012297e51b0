//! Bounded aggregation execution
//!
//! `AggregationRunner` runs any stage list with disk spill allowed, a
//! per-call timeout, and a bounded cursor batch size so one heavy pipeline
//! cannot monopolize the store. Results are never cached here; the facade
//! caches aggregation output only when the caller asks for it explicitly.

use crate::error::StoreError;
use crate::store::traits::DocumentStore;
use crate::types::{AggregateOptions, IndexHint};
use bson::{doc, Bson, Document};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Execution bounds for aggregation pipelines
#[derive(Debug, Clone)]
pub struct AggregationConfig {
    /// Allow stages to spill to disk
    pub allow_disk_use: bool,
    /// Per-call execution deadline
    pub max_time: Duration,
    /// Cursor batch size
    pub batch_size: u32,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            allow_disk_use: true,
            max_time: Duration::from_secs(30),
            batch_size: 1_000,
        }
    }
}

impl AggregationConfig {
    /// Set the per-call deadline
    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time = max_time;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_time < Duration::from_millis(1) {
            return Err("aggregation max_time must be positive".to_string());
        }
        if self.batch_size == 0 {
            return Err("aggregation batch_size must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Executes pipelines against the shared store
pub struct AggregationRunner {
    store: Arc<dyn DocumentStore>,
    config: AggregationConfig,
}

impl AggregationRunner {
    /// Runner over the shared store handle
    pub fn new(store: Arc<dyn DocumentStore>, config: AggregationConfig) -> Self {
        Self { store, config }
    }

    /// Run a pipeline under the configured bounds
    pub async fn execute(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
        hint: Option<IndexHint>,
    ) -> Result<Vec<Document>, StoreError> {
        let options = AggregateOptions {
            allow_disk_use: self.config.allow_disk_use,
            max_time: self.config.max_time,
            batch_size: self.config.batch_size,
            hint,
        };
        let stages = pipeline.len();
        let started = Instant::now();
        let request = self.store.aggregate(collection, pipeline, &options);
        match tokio::time::timeout(self.config.max_time, request).await {
            Ok(Ok(rows)) => {
                debug!(
                    collection,
                    stages,
                    rows = rows.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "aggregation finished"
                );
                Ok(rows)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StoreError::Timeout(format!(
                "aggregation on {} exceeded {}ms",
                collection,
                self.config.max_time.as_millis()
            ))),
        }
    }

    /// `$in` filter over the `_id` values of aggregation rows
    ///
    /// The follow-up enrichment lookup for rankings runs as a separate find
    /// with this filter instead of a join stage.
    pub fn enrichment_filter(id_field: &str, rows: &[Document]) -> Document {
        let ids: Vec<Bson> = rows.iter().filter_map(|r| r.get("_id").cloned()).collect();
        doc! { id_field: { "$in": ids } }
    }
}
