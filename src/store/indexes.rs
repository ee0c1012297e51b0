//! Index lifecycle: default definitions and idempotent bootstrap
//!
//! The default plan distinguishes durable lookup indexes (identity fields,
//! compound location+time keys) from TTL indexes on ephemeral collections.
//! Bootstrap lists what already exists and creates only the missing indexes,
//! always as background builds; failures are logged and swallowed so a
//! degraded store never blocks the primary path.

use crate::store::traits::{DocumentStore, IndexModel};
use bson::doc;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Index definitions for one collection
pub struct CollectionIndexes {
    /// Collection name
    pub collection: &'static str,
    /// Indexes the collection should carry
    pub indexes: Vec<IndexModel>,
}

/// Expiry window for ephemeral presence data
const PRESENCE_EXPIRY: Duration = Duration::from_secs(48 * 3600);

/// Default index plan applied at startup
pub static DEFAULT_INDEX_PLAN: Lazy<Vec<CollectionIndexes>> = Lazy::new(|| {
    vec![
        CollectionIndexes {
            collection: "users",
            indexes: vec![
                IndexModel::new(doc! { "user_id": 1 }).unique(),
                IndexModel::new(doc! { "username": 1 }).sparse(),
            ],
        },
        CollectionIndexes {
            collection: "messages",
            indexes: vec![
                IndexModel::new(doc! { "channel_id": 1, "timestamp": -1 }),
                IndexModel::new(doc! { "user_id": 1, "timestamp": -1 }),
                IndexModel::new(doc! { "guild_id": 1, "channel_id": 1, "timestamp": -1 }),
            ],
        },
        CollectionIndexes {
            collection: "presence",
            indexes: vec![
                IndexModel::new(doc! { "user_id": 1 }).unique(),
                IndexModel::new(doc! { "updated_at": 1 }).expire_after(PRESENCE_EXPIRY),
            ],
        },
    ]
});

/// What one bootstrap pass did
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexBootstrapReport {
    /// Indexes created, as `collection.index_name`
    pub created: Vec<String>,
    /// Indexes that already existed
    pub existing: usize,
    /// Create or list calls that failed
    pub failed: usize,
}

/// Ensure every index in `plan` exists
///
/// Never fails: per-index errors are counted and logged at warn.
pub async fn ensure_indexes(
    store: &Arc<dyn DocumentStore>,
    plan: &[CollectionIndexes],
) -> IndexBootstrapReport {
    let mut report = IndexBootstrapReport::default();
    for entry in plan {
        let existing = match store.list_index_names(entry.collection).await {
            Ok(names) => names,
            Err(e) => {
                warn!(
                    collection = entry.collection,
                    error = %e,
                    "index bootstrap could not list indexes"
                );
                report.failed += entry.indexes.len();
                continue;
            }
        };
        for index in &entry.indexes {
            let name = index.effective_name();
            if existing.iter().any(|n| n == &name) {
                debug!(collection = entry.collection, index = %name, "index already present");
                report.existing += 1;
                continue;
            }
            match store.create_index(entry.collection, index).await {
                Ok(created) => {
                    info!(collection = entry.collection, index = %created, "created index");
                    report.created.push(format!("{}.{}", entry.collection, created));
                }
                Err(e) => {
                    warn!(
                        collection = entry.collection,
                        index = %name,
                        error = %e,
                        "index creation failed"
                    );
                    report.failed += 1;
                }
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::memory::MemoryStore;

    fn store() -> Arc<dyn DocumentStore> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn test_bootstrap_creates_all_defaults() {
        let store = store();
        let report = ensure_indexes(&store, &DEFAULT_INDEX_PLAN).await;
        let total: usize = DEFAULT_INDEX_PLAN.iter().map(|c| c.indexes.len()).sum();
        assert_eq!(report.created.len(), total);
        assert_eq!(report.existing, 0);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let store = store();
        ensure_indexes(&store, &DEFAULT_INDEX_PLAN).await;
        let second = ensure_indexes(&store, &DEFAULT_INDEX_PLAN).await;
        assert!(second.created.is_empty());
        let total: usize = DEFAULT_INDEX_PLAN.iter().map(|c| c.indexes.len()).sum();
        assert_eq!(second.existing, total);
    }

    #[tokio::test]
    async fn test_bootstrap_swallows_failures() {
        let memory = Arc::new(MemoryStore::new());
        memory.fail_next(StoreError::Internal("list blew up".to_string()));
        let store: Arc<dyn DocumentStore> = memory;
        let report = ensure_indexes(&store, &DEFAULT_INDEX_PLAN).await;
        // The first collection's listing failed; later collections proceeded
        assert!(report.failed > 0);
        assert!(!report.created.is_empty());
    }
}
