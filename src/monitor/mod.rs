//! Performance monitoring and recommendations
//!
//! The monitor observes every facade operation:
//! - `signature` collapses parameter-variant queries into lossy shapes
//! - `recorder` keeps bounded histories, running statistics, and trend alerts
//! - `recommend` turns the recorded evidence into prioritized suggestions
//!
//! Everything here is diagnostic. Nothing on this path can fail a caller's
//! operation.

pub mod recommend;
pub mod recorder;
pub mod signature;

pub use recommend::{Priority, Recommendation, RecommendationKind};
pub use recorder::{
    MonitorConfig, OperationSample, PerformanceMonitor, PerformanceReport, TrendAlert,
};
pub use signature::query_signature;
