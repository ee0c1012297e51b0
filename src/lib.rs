//! Remora - Intelligent data access layer for document stores
//!
//! This library wraps a MongoDB-compatible document store with:
//! - TTL result caching with pattern-based invalidation
//! - Query optimization: index hints, filter rewrites, explain probes
//! - Reusable aggregation templates with bounded execution
//! - Batched bulk writes with size and idle-time flush triggers
//! - Performance monitoring, trend alerts, and index recommendations
//!
//! Everything is reached through [`DataLayer`]; construct one with
//! [`DataLayerBuilder`], call `start()`, and issue operations.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod error;
pub mod optimizer;
pub mod store;
pub mod types;

/// Aggregation template library and bounded pipeline executor
pub mod aggregation;

/// Write batching with size, idle, and forced flush triggers
pub mod batch;

/// The access facade tying cache, optimizer, batching, and monitoring
/// together behind one surface
pub mod facade;

/// Operation recording, bounded histories, trend detection, and
/// prioritized recommendations
pub mod monitor;

mod services;

// Re-export main types
pub use config::AccessConfig;
pub use error::{Error, Result};
pub use facade::{DataLayer, DataLayerBuilder};
pub use store::{DocumentStore, MemoryStore};
pub use types::{
    BatchOperation, BulkSummary, ExplainReport, FindOptions, IndexHint, WriteOutcome,
};

#[cfg(test)]
mod tests {
    #[test]
    fn test_root_reexports() {
        let options = crate::FindOptions::new().limit(10);
        assert_eq!(options.limit, Some(10));
    }
}
