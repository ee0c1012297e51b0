//! Configuration surface
//!
//! `AccessConfig` carries every tunable in one TOML-loadable structure with
//! environment variable overrides and sensible defaults. Each section
//! converts into the owning module's config type; the `[store]` section is
//! passed through to whoever constructs the store client.

use crate::aggregation::AggregationConfig;
use crate::batch::BatchConfig;
use crate::cache::{CacheClass, CacheConfig};
use crate::monitor::MonitorConfig;
use crate::optimizer::OptimizerConfig;
use crate::store::{ConnectionConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AccessConfig {
    /// Store client settings, passed through to the driver
    #[serde(default)]
    pub store: StoreSection,

    /// Query cache settings
    #[serde(default)]
    pub cache: CacheSection,

    /// Query optimizer settings
    #[serde(default)]
    pub optimizer: OptimizerSection,

    /// Batch pipeline settings
    #[serde(default)]
    pub batch: BatchSection,

    /// Performance monitor settings
    #[serde(default)]
    pub monitor: MonitorSection,

    /// Connection lifecycle settings
    #[serde(default)]
    pub connection: ConnectionSection,

    /// Aggregation execution bounds
    #[serde(default)]
    pub aggregation: AggregationSection,
}

/// Store client settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreSection {
    /// Connection string
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Database name
    #[serde(default = "default_database")]
    pub database: String,

    /// Minimum pooled connections
    #[serde(default = "default_min_pool_size")]
    pub min_pool_size: u32,

    /// Maximum pooled connections
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: u32,

    /// Wire compressor (zstd, zlib, snappy, none)
    #[serde(default = "default_compressor")]
    pub compressor: String,

    /// Read preference
    #[serde(default = "default_read_preference")]
    pub read_preference: String,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Per-command timeout in seconds
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

/// Query cache settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSection {
    /// Master switch
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Soft occupancy bound
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,

    /// Hard ceiling; omitted derives `max_entries + 25%`
    #[serde(default)]
    pub hard_max_entries: Option<usize>,

    /// Expiry sweep interval in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Per-class TTL overrides in seconds
    #[serde(default)]
    pub ttl_overrides: HashMap<CacheClass, u64>,
}

/// Query optimizer settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OptimizerSection {
    /// Attach index hints from the rule table
    #[serde(default = "default_true")]
    pub enable_hints: bool,

    /// Suggest minimal projections when the caller supplied none
    #[serde(default = "default_true")]
    pub enable_projection_suggestions: bool,

    /// Coerce string-typed numeric identity values
    #[serde(default = "default_true")]
    pub enable_numeric_coercion: bool,

    /// Rewrite free-text equality into case-insensitive prefix regex
    #[serde(default = "default_true")]
    pub enable_text_prefix_rewrite: bool,

    /// Add a recency window to unbounded time-series queries
    #[serde(default = "default_true")]
    pub enable_implicit_time_window: bool,

    /// Implicit recency window in days
    #[serde(default = "default_implicit_window_days")]
    pub implicit_window_days: u64,
}

/// Batch pipeline settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchSection {
    /// Pending count that makes a batch ready
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Idle flush timeout in seconds
    #[serde(default = "default_flush_idle_secs")]
    pub flush_idle_secs: u64,

    /// Operations per bulk command
    #[serde(default = "default_chunk_limit")]
    pub chunk_limit: usize,
}

/// Performance monitor settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorSection {
    /// All-operations history capacity
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Slow-operations ring capacity
    #[serde(default = "default_slow_capacity")]
    pub slow_capacity: usize,

    /// Slow threshold in milliseconds
    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: u64,

    /// Examined-to-returned ratio below which a query is flagged
    #[serde(default = "default_efficiency_threshold")]
    pub efficiency_threshold: f64,

    /// Result size at which a read is flagged
    #[serde(default = "default_large_result_threshold")]
    pub large_result_threshold: usize,

    /// Recent-QPS window in seconds
    #[serde(default = "default_qps_window_secs")]
    pub qps_window_secs: u64,

    /// Trend check interval in seconds
    #[serde(default = "default_trend_interval_secs")]
    pub trend_interval_secs: u64,

    /// Operations per trend window
    #[serde(default = "default_trend_sample")]
    pub trend_sample: usize,

    /// Regression factor for trend alerts
    #[serde(default = "default_trend_factor")]
    pub trend_factor: f64,

    /// Retained trend alerts
    #[serde(default = "default_max_alerts")]
    pub max_alerts: usize,
}

/// Connection lifecycle settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionSection {
    /// Liveness probe interval in seconds
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Reconnect attempts per recovery cycle
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First retry delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Ceiling on any single delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Exponential growth factor
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Jitter fraction applied to each delay
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

/// Aggregation execution bounds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggregationSection {
    /// Allow stages to spill to disk
    #[serde(default = "default_true")]
    pub allow_disk_use: bool,

    /// Per-call deadline in seconds
    #[serde(default = "default_aggregation_max_time_secs")]
    pub max_time_secs: u64,

    /// Cursor batch size
    #[serde(default = "default_aggregation_batch_size")]
    pub batch_size: u32,
}

// Default value functions
fn default_store_url() -> String {
    "mongodb://localhost:27017".to_string()
}
fn default_database() -> String {
    "app".to_string()
}
fn default_min_pool_size() -> u32 {
    2
}
fn default_max_pool_size() -> u32 {
    16
}
fn default_compressor() -> String {
    "zstd".to_string()
}
fn default_read_preference() -> String {
    "primaryPreferred".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_command_timeout_secs() -> u64 {
    30
}
fn default_cache_max_entries() -> usize {
    5_000
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_implicit_window_days() -> u64 {
    30
}
fn default_batch_size() -> usize {
    100
}
fn default_flush_idle_secs() -> u64 {
    30
}
fn default_chunk_limit() -> usize {
    100
}
fn default_history_capacity() -> usize {
    1_000
}
fn default_slow_capacity() -> usize {
    100
}
fn default_slow_threshold_ms() -> u64 {
    100
}
fn default_efficiency_threshold() -> f64 {
    0.1
}
fn default_large_result_threshold() -> usize {
    1_000
}
fn default_qps_window_secs() -> u64 {
    60
}
fn default_trend_interval_secs() -> u64 {
    60
}
fn default_trend_sample() -> usize {
    50
}
fn default_trend_factor() -> f64 {
    1.5
}
fn default_max_alerts() -> usize {
    20
}
fn default_health_check_interval_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    200
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.25
}
fn default_aggregation_max_time_secs() -> u64 {
    30
}
fn default_aggregation_batch_size() -> u32 {
    1_000
}
fn default_true() -> bool {
    true
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            database: default_database(),
            min_pool_size: default_min_pool_size(),
            max_pool_size: default_max_pool_size(),
            compressor: default_compressor(),
            read_preference: default_read_preference(),
            connect_timeout_secs: default_connect_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_cache_max_entries(),
            hard_max_entries: None,
            sweep_interval_secs: default_sweep_interval_secs(),
            ttl_overrides: HashMap::new(),
        }
    }
}

impl Default for OptimizerSection {
    fn default() -> Self {
        Self {
            enable_hints: true,
            enable_projection_suggestions: true,
            enable_numeric_coercion: true,
            enable_text_prefix_rewrite: true,
            enable_implicit_time_window: true,
            implicit_window_days: default_implicit_window_days(),
        }
    }
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_idle_secs: default_flush_idle_secs(),
            chunk_limit: default_chunk_limit(),
        }
    }
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            slow_capacity: default_slow_capacity(),
            slow_threshold_ms: default_slow_threshold_ms(),
            efficiency_threshold: default_efficiency_threshold(),
            large_result_threshold: default_large_result_threshold(),
            qps_window_secs: default_qps_window_secs(),
            trend_interval_secs: default_trend_interval_secs(),
            trend_sample: default_trend_sample(),
            trend_factor: default_trend_factor(),
            max_alerts: default_max_alerts(),
        }
    }
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval_secs(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl Default for AggregationSection {
    fn default() -> Self {
        Self {
            allow_disk_use: true,
            max_time_secs: default_aggregation_max_time_secs(),
            batch_size: default_aggregation_batch_size(),
        }
    }
}

impl AccessConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file {}: {}", path, e))?;

        toml::from_str(&contents)
            .map_err(|e| format!("failed to parse config file {}: {}", path, e))
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> Result<Self, String> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment variable overrides
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("REMORA_STORE_URL") {
            self.store.url = url;
        }
        if let Ok(database) = std::env::var("REMORA_DATABASE") {
            self.store.database = database;
        }
        if let Ok(enabled) = std::env::var("REMORA_CACHE_ENABLED") {
            if let Ok(flag) = enabled.parse() {
                self.cache.enabled = flag;
            }
        }
        if let Ok(max_entries) = std::env::var("REMORA_CACHE_MAX_ENTRIES") {
            if let Ok(n) = max_entries.parse() {
                self.cache.max_entries = n;
            }
        }
        if let Ok(batch_size) = std::env::var("REMORA_BATCH_SIZE") {
            if let Ok(n) = batch_size.parse() {
                self.batch.batch_size = n;
            }
        }
        if let Ok(threshold) = std::env::var("REMORA_SLOW_THRESHOLD_MS") {
            if let Ok(ms) = threshold.parse() {
                self.monitor.slow_threshold_ms = ms;
            }
        }
        if let Ok(interval) = std::env::var("REMORA_HEALTH_CHECK_SECS") {
            if let Ok(secs) = interval.parse() {
                self.connection.health_check_interval_secs = secs;
            }
        }
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), String> {
        let url = Url::parse(&self.store.url)
            .map_err(|e| format!("invalid store url {}: {}", self.store.url, e))?;
        if !matches!(url.scheme(), "mongodb" | "mongodb+srv") {
            return Err(format!("unsupported store url scheme: {}", url.scheme()));
        }
        if self.store.database.is_empty() {
            return Err("store database must not be empty".to_string());
        }
        if self.store.max_pool_size == 0 {
            return Err("store max_pool_size must be at least 1".to_string());
        }
        if self.store.min_pool_size > self.store.max_pool_size {
            return Err("store min_pool_size exceeds max_pool_size".to_string());
        }
        if !matches!(self.store.compressor.as_str(), "zstd" | "zlib" | "snappy" | "none") {
            return Err(format!("unknown compressor: {}", self.store.compressor));
        }
        if !matches!(
            self.store.read_preference.as_str(),
            "primary" | "primaryPreferred" | "secondary" | "secondaryPreferred" | "nearest"
        ) {
            return Err(format!(
                "unknown read preference: {}",
                self.store.read_preference
            ));
        }
        if self.store.connect_timeout_secs == 0 || self.store.command_timeout_secs == 0 {
            return Err("store timeouts must be positive".to_string());
        }

        self.cache_config().validate()?;
        self.optimizer_config().validate()?;
        self.batch_config().validate()?;
        self.monitor_config().validate()?;
        self.connection_config().validate()?;
        self.aggregation_config().validate()?;
        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &str) -> Result<(), String> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| format!("failed to serialize config: {}", e))?;

        std::fs::write(path, contents)
            .map_err(|e| format!("failed to write config file {}: {}", path, e))
    }

    /// Cache section as the cache module's config
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            enabled: self.cache.enabled,
            max_entries: self.cache.max_entries,
            hard_max_entries: self.cache.hard_max_entries,
            sweep_interval: Duration::from_secs(self.cache.sweep_interval_secs),
            ttl_overrides: self
                .cache
                .ttl_overrides
                .iter()
                .map(|(class, secs)| (*class, Duration::from_secs(*secs)))
                .collect(),
        }
    }

    /// Optimizer section as the optimizer module's config
    pub fn optimizer_config(&self) -> OptimizerConfig {
        OptimizerConfig {
            enable_hints: self.optimizer.enable_hints,
            enable_projection_suggestions: self.optimizer.enable_projection_suggestions,
            enable_numeric_coercion: self.optimizer.enable_numeric_coercion,
            enable_text_prefix_rewrite: self.optimizer.enable_text_prefix_rewrite,
            enable_implicit_time_window: self.optimizer.enable_implicit_time_window,
            implicit_window: Duration::from_secs(self.optimizer.implicit_window_days * 24 * 3600),
        }
    }

    /// Batch section as the batch module's config
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            batch_size: self.batch.batch_size,
            flush_idle: Duration::from_secs(self.batch.flush_idle_secs),
            chunk_limit: self.batch.chunk_limit,
        }
    }

    /// Monitor section as the monitor module's config
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            history_capacity: self.monitor.history_capacity,
            slow_capacity: self.monitor.slow_capacity,
            slow_threshold: Duration::from_millis(self.monitor.slow_threshold_ms),
            efficiency_threshold: self.monitor.efficiency_threshold,
            large_result_threshold: self.monitor.large_result_threshold,
            qps_window: Duration::from_secs(self.monitor.qps_window_secs),
            trend_interval: Duration::from_secs(self.monitor.trend_interval_secs),
            trend_sample: self.monitor.trend_sample,
            trend_factor: self.monitor.trend_factor,
            max_alerts: self.monitor.max_alerts,
        }
    }

    /// Connection section as the store module's config
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            health_check_interval: Duration::from_secs(self.connection.health_check_interval_secs),
            retry: RetryPolicy {
                max_retries: self.connection.max_retries,
                base_delay: Duration::from_millis(self.connection.base_delay_ms),
                max_delay: Duration::from_millis(self.connection.max_delay_ms),
                multiplier: self.connection.backoff_multiplier,
                jitter: self.connection.jitter,
            },
        }
    }

    /// Aggregation section as the aggregation module's config
    pub fn aggregation_config(&self) -> AggregationConfig {
        AggregationConfig {
            allow_disk_use: self.aggregation.allow_disk_use,
            max_time: Duration::from_secs(self.aggregation.max_time_secs),
            batch_size: self.aggregation.batch_size,
        }
    }
}
