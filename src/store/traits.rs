//! Document store abstraction
//!
//! Everything above this layer talks to a [`DocumentStore`] trait object
//! rather than a concrete driver. The trait models the MongoDB wire
//! vocabulary (find/aggregate/bulk write/explain/index DDL) with typed
//! results, so cache, optimizer, batch, and monitor logic stay independent
//! of which store actually serves the traffic.

use crate::error::StoreError;
use crate::types::{
    AggregateOptions, BatchOperation, BulkSummary, ExplainReport, FindOptions, WriteOutcome,
};
use async_trait::async_trait;
use bson::Document;
use std::time::Duration;

/// Definition of one index on a collection
///
/// Key order in `keys` is the compound-index order sent to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexModel {
    /// Ordered key pattern, e.g. `{ "channel_id": 1, "timestamp": -1 }`
    pub keys: Document,
    /// Explicit index name; derived from the keys when `None`
    pub name: Option<String>,
    /// Reject duplicate key values
    pub unique: bool,
    /// Skip documents missing the indexed fields
    pub sparse: bool,
    /// Expire documents this long after their indexed timestamp
    pub expire_after: Option<Duration>,
    /// Build without blocking writes
    pub background: bool,
}

impl IndexModel {
    /// Index over `keys` with defaults for everything else
    pub fn new(keys: Document) -> Self {
        Self {
            keys,
            name: None,
            unique: false,
            sparse: false,
            expire_after: None,
            background: true,
        }
    }

    /// Set an explicit name
    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Mark the index unique
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Mark the index sparse
    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    /// Expire indexed documents after `ttl`
    pub fn expire_after(mut self, ttl: Duration) -> Self {
        self.expire_after = Some(ttl);
        self
    }

    /// Effective index name: the explicit one, or the conventional
    /// `field_direction` concatenation derived from the key pattern.
    pub fn effective_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        let parts: Vec<String> = self
            .keys
            .iter()
            .map(|(field, dir)| format!("{}_{}", field, direction_token(dir)))
            .collect();
        parts.join("_")
    }
}

fn direction_token(value: &bson::Bson) -> String {
    match value {
        bson::Bson::Int32(n) => n.to_string(),
        bson::Bson::Int64(n) => n.to_string(),
        bson::Bson::Double(n) => n.to_string(),
        bson::Bson::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Async interface every backing document store implements
///
/// Implementations must be safe to share behind an `Arc` across tasks. All
/// methods map one-to-one onto wire commands; none of them cache, retry, or
/// reshape queries, which is the job of the layers above.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Cheap liveness probe
    async fn ping(&self) -> Result<(), StoreError>;

    /// Fetch a single document matching `filter`
    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
        projection: Option<Document>,
    ) -> Result<Option<Document>, StoreError>;

    /// Fetch all documents matching `filter`, honoring `options`
    async fn find(
        &self,
        collection: &str,
        filter: Document,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError>;

    /// Count documents matching `filter`
    async fn count(&self, collection: &str, filter: Document) -> Result<u64, StoreError>;

    /// Run an aggregation pipeline
    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
        options: &AggregateOptions,
    ) -> Result<Vec<Document>, StoreError>;

    /// Insert one document
    async fn insert_one(
        &self,
        collection: &str,
        document: Document,
    ) -> Result<WriteOutcome, StoreError>;

    /// Update the first document matching `filter`
    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> Result<WriteOutcome, StoreError>;

    /// Update every document matching `filter`
    async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> Result<WriteOutcome, StoreError>;

    /// Delete the first document matching `filter`
    async fn delete_one(&self, collection: &str, filter: Document)
        -> Result<WriteOutcome, StoreError>;

    /// Delete every document matching `filter`
    async fn delete_many(
        &self,
        collection: &str,
        filter: Document,
    ) -> Result<WriteOutcome, StoreError>;

    /// Replace the first document matching `filter` wholesale
    async fn replace_one(
        &self,
        collection: &str,
        filter: Document,
        replacement: Document,
        upsert: bool,
    ) -> Result<WriteOutcome, StoreError>;

    /// Execute a batch of writes as one unordered bulk command
    ///
    /// Individual operation failures are folded into the summary; the call
    /// errors only when the command itself cannot run.
    async fn bulk_write(
        &self,
        collection: &str,
        operations: &[BatchOperation],
    ) -> Result<BulkSummary, StoreError>;

    /// Explain how the store would execute a find
    async fn explain_find(
        &self,
        collection: &str,
        filter: Document,
        options: &FindOptions,
    ) -> Result<ExplainReport, StoreError>;

    /// Names of all indexes on `collection`
    async fn list_index_names(&self, collection: &str) -> Result<Vec<String>, StoreError>;

    /// Create an index, returning its effective name
    ///
    /// Creating an index that already exists with the same definition is a
    /// no-op and must succeed.
    async fn create_index(
        &self,
        collection: &str,
        index: &IndexModel,
    ) -> Result<String, StoreError>;
}
