//! Query optimization
//!
//! - [`rules`]: the static hint/projection/time-series/coercion tables
//! - [`query`]: the optimizer proper (rewrites, hint selection, trail)
//! - [`explain`]: non-failing explain probe

pub mod explain;
pub mod query;
pub mod rules;

pub use query::{AppliedOptimization, OptimizedQuery, OptimizerConfig, QueryOptimizer};
