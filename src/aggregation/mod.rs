//! Aggregation templates and bounded execution
//!
//! Two halves:
//! - `templates` builds the common analytical pipelines (activity rollups,
//!   rankings, histograms, anomaly summaries) as plain stage lists
//! - `executor` runs any stage list under disk-use, timeout, and batch-size
//!   bounds shared by every pipeline
//!
//! Templates stay data-only so callers can inspect or extend the stages
//! before handing them to the runner.

pub mod executor;
pub mod templates;

pub use executor::{AggregationConfig, AggregationRunner};
