//! Intelligent result caching
//!
//! - [`key`]: canonical shape fingerprinting and key derivation
//! - [`policy`]: cache classes, TTL/priority table, classification rules
//! - [`patterns`]: identity fields and invalidation pattern derivation
//! - [`query_cache`]: the cache proper (entries, reverse pattern index,
//!   scored eviction, stats)

pub mod key;
pub mod patterns;
pub mod policy;
pub mod query_cache;

pub use key::CacheKey;
pub use policy::{CacheClass, CachePolicy};
pub use query_cache::{CacheConfig, CacheStats, CachedValue, QueryCache};
