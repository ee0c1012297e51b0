//! Document store subsystem
//!
//! - [`traits`]: the `DocumentStore` seam everything programs against
//! - [`memory`]: process-local engine used in tests and embedded deployments
//! - [`matcher`]: filter/update/projection evaluation for the memory engine
//! - [`connection`]: shared handle lifecycle, liveness, reconnect policy
//! - [`indexes`]: default index plan and idempotent bootstrap

pub mod connection;
pub mod indexes;
pub mod matcher;
pub mod memory;
pub mod traits;

pub use connection::{ConnectionConfig, ConnectionManager, ConnectionStatsSnapshot, RetryPolicy};
pub use indexes::{ensure_indexes, CollectionIndexes, IndexBootstrapReport, DEFAULT_INDEX_PLAN};
pub use memory::MemoryStore;
pub use traits::{DocumentStore, IndexModel};
