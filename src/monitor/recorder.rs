//! Operation recording and performance statistics
//!
//! Every facade operation lands here as an `OperationSample`. The recorder
//! attaches diagnostic suggestions at record time, keeps bounded FIFO
//! histories (all operations plus a smaller slow ring), maintains running
//! statistics, and periodically compares recent mean latency against the
//! preceding window to flag regressions.

use crate::cache::patterns::IDENTITY_FIELDS;
use crate::monitor::recommend::{self, Recommendation};
use crate::monitor::signature::query_signature;
use crate::types::ExplainReport;
use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};

/// Entries kept per report section
const REPORT_TOP: usize = 10;

// ============================================================================
// Configuration
// ============================================================================

/// Monitor tuning knobs
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Capacity of the all-operations ring buffer
    pub history_capacity: usize,
    /// Capacity of the slow-operations ring buffer
    pub slow_capacity: usize,
    /// Duration at which an operation counts as slow
    pub slow_threshold: Duration,
    /// Examined-to-returned ratio below which a query is flagged
    pub efficiency_threshold: f64,
    /// Result size at which a read is flagged as unbounded
    pub large_result_threshold: usize,
    /// Window for the recent-QPS figure
    pub qps_window: Duration,
    /// How often the trend check runs
    pub trend_interval: Duration,
    /// Operations per window in the trend comparison
    pub trend_sample: usize,
    /// Regression factor: recent mean must exceed baseline by this much
    pub trend_factor: f64,
    /// Bounded count of retained trend alerts
    pub max_alerts: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1_000,
            slow_capacity: 100,
            slow_threshold: Duration::from_millis(100),
            efficiency_threshold: 0.1,
            large_result_threshold: 1_000,
            qps_window: Duration::from_secs(60),
            trend_interval: Duration::from_secs(60),
            trend_sample: 50,
            trend_factor: 1.5,
            max_alerts: 20,
        }
    }
}

impl MonitorConfig {
    /// Set the all-operations history capacity
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Set the slow-operations ring capacity
    pub fn with_slow_capacity(mut self, capacity: usize) -> Self {
        self.slow_capacity = capacity;
        self
    }

    /// Set the slow-operation threshold
    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    /// Set the trend window size
    pub fn with_trend_sample(mut self, sample: usize) -> Self {
        self.trend_sample = sample;
        self
    }

    /// Set the trend regression factor
    pub fn with_trend_factor(mut self, factor: f64) -> Self {
        self.trend_factor = factor;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.history_capacity == 0 {
            return Err("monitor history_capacity must be at least 1".to_string());
        }
        if self.slow_capacity == 0 {
            return Err("monitor slow_capacity must be at least 1".to_string());
        }
        if self.slow_threshold.is_zero() {
            return Err("monitor slow_threshold must be positive".to_string());
        }
        if self.efficiency_threshold <= 0.0 || self.efficiency_threshold > 1.0 {
            return Err("monitor efficiency_threshold must be in (0, 1]".to_string());
        }
        if self.large_result_threshold == 0 {
            return Err("monitor large_result_threshold must be at least 1".to_string());
        }
        if self.qps_window < Duration::from_secs(1) {
            return Err("monitor qps_window must be at least 1s".to_string());
        }
        if self.trend_interval < Duration::from_secs(1) {
            return Err("monitor trend_interval must be at least 1s".to_string());
        }
        if self.trend_sample == 0 {
            return Err("monitor trend_sample must be at least 1".to_string());
        }
        if self.trend_factor <= 1.0 {
            return Err("monitor trend_factor must exceed 1.0".to_string());
        }
        if self.max_alerts == 0 {
            return Err("monitor max_alerts must be at least 1".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Samples and recorded entries
// ============================================================================

/// One observed operation, as reported by the facade
#[derive(Debug, Clone)]
pub struct OperationSample {
    /// Target collection
    pub collection: String,
    /// Operation name (`find`, `update_one`, `bulk_write`, ...)
    pub operation: String,
    /// The filter the caller passed (empty for inserts and bulk writes)
    pub filter: Document,
    /// Wall-clock execution time
    pub duration: Duration,
    /// Documents returned or affected
    pub result_count: usize,
    /// Whether the cache served this operation
    pub cache_hit: bool,
    /// Explain data, when a probe ran
    pub explain: Option<ExplainReport>,
}

impl OperationSample {
    /// Sample with zeroed measurements, filled in by the builder methods
    pub fn new(collection: impl Into<String>, operation: impl Into<String>, filter: Document) -> Self {
        Self {
            collection: collection.into(),
            operation: operation.into(),
            filter,
            duration: Duration::ZERO,
            result_count: 0,
            cache_hit: false,
            explain: None,
        }
    }

    /// Set the execution time
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Set the result count
    pub fn with_result_count(mut self, count: usize) -> Self {
        self.result_count = count;
        self
    }

    /// Mark the sample as served from cache
    pub fn from_cache(mut self) -> Self {
        self.cache_hit = true;
        self
    }

    /// Attach explain data
    pub fn with_explain(mut self, explain: ExplainReport) -> Self {
        self.explain = Some(explain);
        self
    }
}

/// A sample after recording: signature, suggestions, and timestamp attached
#[derive(Debug, Clone, Serialize)]
pub struct RecordedOperation {
    /// Lossy query signature
    pub signature: String,
    /// Target collection
    pub collection: String,
    /// Operation name
    pub operation: String,
    /// Execution time in milliseconds
    pub duration_ms: f64,
    /// Documents returned or affected
    pub result_count: usize,
    /// Whether the cache served this operation
    pub cache_hit: bool,
    /// `Some(true)` index-backed, `Some(false)` collection scan, `None` unknown
    pub indexed: Option<bool>,
    /// Diagnostics attached at record time
    pub suggestions: Vec<String>,
    /// When the operation was recorded
    pub recorded_at: DateTime<Utc>,
}

/// Latency regression flagged by the trend check
#[derive(Debug, Clone, Serialize)]
pub struct TrendAlert {
    /// When the regression was detected
    pub detected_at: DateTime<Utc>,
    /// Mean latency of the most recent window
    pub recent_avg_ms: f64,
    /// Mean latency of the preceding window
    pub baseline_avg_ms: f64,
    /// recent / baseline
    pub factor: f64,
    /// Operations per window
    pub sample_size: usize,
}

// ============================================================================
// Tallies
// ============================================================================

#[derive(Debug, Default, Clone)]
pub(crate) struct CollectionTally {
    pub(crate) accesses: u64,
    pub(crate) cache_hits: u64,
    pub(crate) indexed: u64,
    pub(crate) scans: u64,
    pub(crate) total_ms: f64,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct SignatureTally {
    pub(crate) collection: String,
    pub(crate) uses: u64,
    pub(crate) cache_hits: u64,
    pub(crate) total_ms: f64,
}

#[derive(Debug, Default)]
struct Totals {
    operations: u64,
    cache_hits: u64,
    indexed: u64,
    scans: u64,
    avg_ms: f64,
}

#[derive(Debug, Default)]
struct MonitorState {
    history: VecDeque<RecordedOperation>,
    slow: VecDeque<RecordedOperation>,
    per_collection: HashMap<String, CollectionTally>,
    per_signature: HashMap<String, SignatureTally>,
    alerts: VecDeque<TrendAlert>,
    totals: Totals,
}

// ============================================================================
// Report
// ============================================================================

/// Per-signature entry in the report
#[derive(Debug, Clone, Serialize)]
pub struct PatternStats {
    /// Lossy query signature
    pub signature: String,
    /// Collection the signature targets
    pub collection: String,
    /// Times the signature was recorded
    pub uses: u64,
    /// Cache hits over uses
    pub cache_hit_rate: f64,
    /// Mean execution time
    pub avg_execution_ms: f64,
}

/// Per-collection entry in the report
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStats {
    /// Collection name
    pub collection: String,
    /// Operations recorded against the collection
    pub accesses: u64,
    /// Operations served from cache
    pub cache_hits: u64,
    /// Explained operations that used an index
    pub indexed: u64,
    /// Explained operations that scanned the collection
    pub collection_scans: u64,
    /// Mean execution time
    pub avg_execution_ms: f64,
}

/// Snapshot of everything the monitor knows
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    /// When the report was generated
    pub generated_at: DateTime<Utc>,
    /// Operations recorded since startup
    pub total_operations: u64,
    /// Incremental mean execution time
    pub avg_execution_ms: f64,
    /// Cache hits over all operations
    pub cache_hit_rate: f64,
    /// Explained operations that used an index
    pub indexed_operations: u64,
    /// Explained operations that scanned the collection
    pub collection_scans: u64,
    /// indexed / (indexed + scans), 0 when nothing was explained
    pub index_hit_ratio: f64,
    /// Operations per second over the recent window
    pub recent_qps: f64,
    /// Slowest retained operations, worst first
    pub slow_queries: Vec<RecordedOperation>,
    /// Most-used query signatures
    pub top_patterns: Vec<PatternStats>,
    /// Per-collection tallies, busiest first
    pub collections: Vec<CollectionStats>,
    /// Retained latency regressions
    pub trend_alerts: Vec<TrendAlert>,
}

// ============================================================================
// Monitor
// ============================================================================

/// Records operations and derives statistics, trends, and recommendations
pub struct PerformanceMonitor {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
}

impl PerformanceMonitor {
    /// Monitor with the given configuration
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// How often the owner should run `check_trends`
    pub fn trend_interval(&self) -> Duration {
        self.config.trend_interval
    }

    /// Operations recorded since startup
    pub fn total_operations(&self) -> u64 {
        self.state.lock().totals.operations
    }

    /// Record one operation and attach diagnostics
    pub fn record(&self, sample: OperationSample) {
        let signature = query_signature(&sample.collection, &sample.operation, &sample.filter);
        let duration_ms = sample.duration.as_secs_f64() * 1_000.0;
        let indexed = sample.explain.as_ref().map(|e| !e.is_collection_scan());
        let slow = sample.duration >= self.config.slow_threshold;

        let mut suggestions = Vec::new();
        if slow {
            suggestions.push(format!(
                "execution took {:.1}ms, over the {}ms slow threshold",
                duration_ms,
                self.config.slow_threshold.as_millis()
            ));
        }
        if let Some(explain) = &sample.explain {
            if explain.is_collection_scan() {
                suggestions.push(format!(
                    "collection scan on {}: no index covers this filter",
                    sample.collection
                ));
            } else if explain.efficiency() < self.config.efficiency_threshold {
                suggestions.push(format!(
                    "low index efficiency: examined {} documents to return {}",
                    explain.docs_examined, explain.docs_returned
                ));
            }
        }
        if matches!(sample.operation.as_str(), "find" | "find_one")
            && !mentions_identity(&sample.filter)
        {
            suggestions.push("no identity field in filter".to_string());
        }
        if sample.result_count >= self.config.large_result_threshold {
            suggestions.push(format!(
                "{} documents returned, consider a limit or a tighter filter",
                sample.result_count
            ));
        }

        if slow {
            warn!(
                collection = %sample.collection,
                operation = %sample.operation,
                duration_ms,
                %signature,
                "slow operation recorded"
            );
        }

        let entry = RecordedOperation {
            signature: signature.clone(),
            collection: sample.collection.clone(),
            operation: sample.operation.clone(),
            duration_ms,
            result_count: sample.result_count,
            cache_hit: sample.cache_hit,
            indexed,
            suggestions,
            recorded_at: Utc::now(),
        };

        let mut state = self.state.lock();
        if state.history.len() == self.config.history_capacity {
            state.history.pop_front();
        }
        state.history.push_back(entry.clone());
        if slow {
            if state.slow.len() == self.config.slow_capacity {
                state.slow.pop_front();
            }
            state.slow.push_back(entry);
        }

        state.totals.operations += 1;
        let n = state.totals.operations as f64;
        state.totals.avg_ms += (duration_ms - state.totals.avg_ms) / n;
        if sample.cache_hit {
            state.totals.cache_hits += 1;
        }
        match indexed {
            Some(true) => state.totals.indexed += 1,
            Some(false) => state.totals.scans += 1,
            None => {}
        }

        let tally = state.per_collection.entry(sample.collection.clone()).or_default();
        tally.accesses += 1;
        tally.total_ms += duration_ms;
        if sample.cache_hit {
            tally.cache_hits += 1;
        }
        match indexed {
            Some(true) => tally.indexed += 1,
            Some(false) => tally.scans += 1,
            None => {}
        }

        let sig_tally = state.per_signature.entry(signature).or_default();
        if sig_tally.collection.is_empty() {
            sig_tally.collection = sample.collection;
        }
        sig_tally.uses += 1;
        sig_tally.total_ms += duration_ms;
        if sample.cache_hit {
            sig_tally.cache_hits += 1;
        }
    }

    /// Compare recent mean latency against the preceding window
    ///
    /// Returns the alert when recent exceeds baseline by more than the
    /// configured factor. Needs two full windows of history.
    pub fn check_trends(&self) -> Option<TrendAlert> {
        let mut state = self.state.lock();
        let n = self.config.trend_sample;
        let len = state.history.len();
        if len < n * 2 {
            return None;
        }
        let mean = |range: std::ops::Range<usize>| -> f64 {
            state
                .history
                .iter()
                .skip(range.start)
                .take(range.end - range.start)
                .map(|e| e.duration_ms)
                .sum::<f64>()
                / n as f64
        };
        let baseline = mean(len - 2 * n..len - n);
        let recent = mean(len - n..len);
        if baseline <= 0.0 {
            return None;
        }
        let factor = recent / baseline;
        if factor <= self.config.trend_factor {
            debug!(recent_avg_ms = recent, baseline_avg_ms = baseline, "latency stable");
            return None;
        }
        let alert = TrendAlert {
            detected_at: Utc::now(),
            recent_avg_ms: recent,
            baseline_avg_ms: baseline,
            factor,
            sample_size: n,
        };
        warn!(
            recent_avg_ms = recent,
            baseline_avg_ms = baseline,
            factor,
            "latency regression detected"
        );
        if state.alerts.len() == self.config.max_alerts {
            state.alerts.pop_front();
        }
        state.alerts.push_back(alert.clone());
        Some(alert)
    }

    /// Snapshot aggregate statistics, top offenders, and trend alerts
    pub fn report(&self) -> PerformanceReport {
        let state = self.state.lock();
        let totals = &state.totals;
        let cache_hit_rate = if totals.operations > 0 {
            totals.cache_hits as f64 / totals.operations as f64
        } else {
            0.0
        };
        let explained = totals.indexed + totals.scans;
        let index_hit_ratio = if explained > 0 {
            totals.indexed as f64 / explained as f64
        } else {
            0.0
        };

        let window = chrono::Duration::from_std(self.config.qps_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let cutoff = Utc::now() - window;
        let recent = state
            .history
            .iter()
            .rev()
            .take_while(|e| e.recorded_at >= cutoff)
            .count();
        let recent_qps = recent as f64 / self.config.qps_window.as_secs_f64();

        let mut slow_queries: Vec<RecordedOperation> = state.slow.iter().cloned().collect();
        slow_queries.sort_by(|a, b| {
            b.duration_ms
                .partial_cmp(&a.duration_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        slow_queries.truncate(REPORT_TOP);

        let mut top_patterns: Vec<PatternStats> = state
            .per_signature
            .iter()
            .map(|(signature, t)| PatternStats {
                signature: signature.clone(),
                collection: t.collection.clone(),
                uses: t.uses,
                cache_hit_rate: if t.uses > 0 {
                    t.cache_hits as f64 / t.uses as f64
                } else {
                    0.0
                },
                avg_execution_ms: if t.uses > 0 { t.total_ms / t.uses as f64 } else { 0.0 },
            })
            .collect();
        top_patterns.sort_by(|a, b| b.uses.cmp(&a.uses).then_with(|| a.signature.cmp(&b.signature)));
        top_patterns.truncate(REPORT_TOP);

        let mut collections: Vec<CollectionStats> = state
            .per_collection
            .iter()
            .map(|(name, t)| CollectionStats {
                collection: name.clone(),
                accesses: t.accesses,
                cache_hits: t.cache_hits,
                indexed: t.indexed,
                collection_scans: t.scans,
                avg_execution_ms: if t.accesses > 0 { t.total_ms / t.accesses as f64 } else { 0.0 },
            })
            .collect();
        collections.sort_by(|a, b| b.accesses.cmp(&a.accesses).then_with(|| a.collection.cmp(&b.collection)));

        PerformanceReport {
            generated_at: Utc::now(),
            total_operations: totals.operations,
            avg_execution_ms: totals.avg_ms,
            cache_hit_rate,
            indexed_operations: totals.indexed,
            collection_scans: totals.scans,
            index_hit_ratio,
            recent_qps,
            slow_queries,
            top_patterns,
            collections,
            trend_alerts: state.alerts.iter().cloned().collect(),
        }
    }

    /// Derive index and cache recommendations from the recorded history
    pub fn recommendations(&self) -> Vec<Recommendation> {
        let state = self.state.lock();
        recommend::generate(&state.slow, &state.per_collection, &state.per_signature)
    }
}

/// Whether any identity field appears anywhere in the filter
fn mentions_identity(filter: &Document) -> bool {
    for (key, value) in filter {
        if key.starts_with('$') {
            if let Bson::Array(clauses) = value {
                for clause in clauses {
                    if let Bson::Document(inner) = clause {
                        if mentions_identity(inner) {
                            return true;
                        }
                    }
                }
            }
            continue;
        }
        let root = key.split('.').next().unwrap_or(key);
        if IDENTITY_FIELDS.contains(&root) {
            return true;
        }
    }
    false
}

// ============================================================================
// Tests
// ============================================================================
