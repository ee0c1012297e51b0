//! Core data types used throughout the access layer
//!
//! This module defines the wire-level shapes shared across the system:
//!
//! # Key Types
//!
//! - **`QueryShape`**: Canonical description of one read operation
//! - **`FindOptions`**: Projection/sort/limit/skip/hint for a find
//! - **`WriteOutcome`**: Tagged result of a single write command
//! - **`BulkSummary`**: Folded result of one or more bulk write commands
//! - **`BatchOperation`**: One pending write queued for bulk execution
//! - **`ExplainReport`**: Diagnostic execution report for a query
//! - **`AggregateOptions`**: Bounded execution options for pipelines
//!
//! All document payloads are [`bson::Document`], which preserves key order —
//! filters, update documents, pipeline stages, and compound index keys keep
//! the exact shape the MongoDB wire protocol expects.

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Kind of read operation a [`QueryShape`] describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadOperation {
    /// Single-document lookup
    FindOne,
    /// Multi-document query
    Find,
    /// Document count
    Count,
    /// Aggregation pipeline
    Aggregate,
}

impl ReadOperation {
    /// Stable lowercase name used in keys, signatures, and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadOperation::FindOne => "find_one",
            ReadOperation::Find => "find",
            ReadOperation::Count => "count",
            ReadOperation::Aggregate => "aggregate",
        }
    }
}

impl fmt::Display for ReadOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical description of a read
///
/// Two logically identical reads produce equal shapes regardless of the order
/// in which their filter documents were assembled; the cache key is derived
/// from a key-sorted serialization of this struct. Shapes are computed per
/// call and never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryShape {
    /// Target collection
    pub collection: String,
    /// Operation kind
    pub operation: ReadOperation,
    /// Query filter (for aggregations, the pipeline folded under `"stages"`)
    pub filter: Document,
    /// Requested projection, if any
    pub projection: Option<Document>,
    /// Requested sort, if any
    pub sort: Option<Document>,
    /// Result limit, if any
    pub limit: Option<i64>,
    /// Result offset, if any
    pub skip: Option<u64>,
}

impl QueryShape {
    /// Shape of a single-document lookup
    pub fn find_one(collection: &str, filter: Document) -> Self {
        Self {
            collection: collection.to_string(),
            operation: ReadOperation::FindOne,
            filter,
            projection: None,
            sort: None,
            limit: None,
            skip: None,
        }
    }

    /// Shape of a multi-document query
    pub fn find(collection: &str, filter: Document, options: &FindOptions) -> Self {
        Self {
            collection: collection.to_string(),
            operation: ReadOperation::Find,
            filter,
            projection: options.projection.clone(),
            sort: options.sort.clone(),
            limit: options.limit,
            skip: options.skip,
        }
    }

    /// Shape of a count
    pub fn count(collection: &str, filter: Document) -> Self {
        Self {
            collection: collection.to_string(),
            operation: ReadOperation::Count,
            filter,
            projection: None,
            sort: None,
            limit: None,
            skip: None,
        }
    }

    /// Shape of an aggregation. The stage list is folded into the filter slot
    /// under a `"stages"` key so keying treats the pipeline as the predicate.
    pub fn aggregate(collection: &str, pipeline: &[Document]) -> Self {
        let stages: Vec<Bson> = pipeline.iter().cloned().map(Bson::Document).collect();
        let mut filter = Document::new();
        filter.insert("stages", Bson::Array(stages));
        Self {
            collection: collection.to_string(),
            operation: ReadOperation::Aggregate,
            filter,
            projection: None,
            sort: None,
            limit: None,
            skip: None,
        }
    }
}

/// Index hint passed through to the store
///
/// Either an index name or an ordered key document, mirroring the two forms
/// the wire protocol accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexHint {
    /// Hint by index name
    Name(String),
    /// Hint by key pattern (key order matters)
    Keys(Document),
}

impl IndexHint {
    /// Wire representation of the hint
    pub fn to_bson(&self) -> Bson {
        match self {
            IndexHint::Name(name) => Bson::String(name.clone()),
            IndexHint::Keys(keys) => Bson::Document(keys.clone()),
        }
    }
}

impl fmt::Display for IndexHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexHint::Name(name) => f.write_str(name),
            IndexHint::Keys(keys) => write!(f, "{}", keys),
        }
    }
}

/// Options for a find command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Fields to return; `None` lets the optimizer suggest one
    pub projection: Option<Document>,
    /// Sort specification
    pub sort: Option<Document>,
    /// Maximum documents to return
    pub limit: Option<i64>,
    /// Documents to skip
    pub skip: Option<u64>,
    /// Index hint to pass to the store
    pub hint: Option<IndexHint>,
}

impl FindOptions {
    /// Empty options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the projection
    pub fn projection(mut self, projection: Document) -> Self {
        self.projection = Some(projection);
        self
    }

    /// Set the sort
    pub fn sort(mut self, sort: Document) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Set the limit
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the skip
    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Set the index hint
    pub fn hint(mut self, hint: IndexHint) -> Self {
        self.hint = Some(hint);
        self
    }
}

/// Result of a single write command, tagged by what the command did
///
/// The layer never inspects untyped result documents for count fields; every
/// store write funnels into this union.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOutcome {
    /// Documents inserted
    Inserted(u64),
    /// Documents modified by an update
    Updated(u64),
    /// Documents removed
    Deleted(u64),
    /// Documents created through an upsert
    Upserted(u64),
}

impl WriteOutcome {
    /// Number of documents the write touched
    pub fn count(&self) -> u64 {
        match self {
            WriteOutcome::Inserted(n)
            | WriteOutcome::Updated(n)
            | WriteOutcome::Deleted(n)
            | WriteOutcome::Upserted(n) => *n,
        }
    }
}

impl fmt::Display for WriteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteOutcome::Inserted(n) => write!(f, "inserted={}", n),
            WriteOutcome::Updated(n) => write!(f, "updated={}", n),
            WriteOutcome::Deleted(n) => write!(f, "deleted={}", n),
            WriteOutcome::Upserted(n) => write!(f, "upserted={}", n),
        }
    }
}

/// One operation that failed inside a bulk write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkWriteFailure {
    /// Position of the operation in the submitted batch
    pub index: usize,
    /// Store error code, when the store reports one
    pub code: Option<i32>,
    /// Human-readable failure description
    pub message: String,
}

/// Folded result of one or more bulk write commands
///
/// Partial failures are accounted here rather than raised as errors: applied
/// counts stay correct and `failed`/`errors` report what did not apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkSummary {
    /// Documents inserted
    pub inserted: u64,
    /// Documents modified
    pub updated: u64,
    /// Documents removed
    pub deleted: u64,
    /// Documents created through upserts
    pub upserted: u64,
    /// Operations that failed
    pub failed: u64,
    /// Details for each failed operation
    pub errors: Vec<BulkWriteFailure>,
}

impl BulkSummary {
    /// Empty summary
    pub fn new() -> Self {
        Self::default()
    }

    /// Total documents applied across all outcome kinds
    pub fn total_applied(&self) -> u64 {
        self.inserted + self.updated + self.deleted + self.upserted
    }

    /// Fold another summary into this one, offsetting failure indexes by
    /// `index_offset` so positions refer to the original submission.
    pub fn merge(&mut self, other: BulkSummary, index_offset: usize) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.upserted += other.upserted;
        self.failed += other.failed;
        self.errors.extend(other.errors.into_iter().map(|mut e| {
            e.index += index_offset;
            e
        }));
    }

    /// Record a single outcome into the summary
    pub fn absorb(&mut self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Inserted(n) => self.inserted += n,
            WriteOutcome::Updated(n) => self.updated += n,
            WriteOutcome::Deleted(n) => self.deleted += n,
            WriteOutcome::Upserted(n) => self.upserted += n,
        }
    }
}

impl fmt::Display for BulkSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "inserted={} updated={} deleted={} upserted={} failed={}",
            self.inserted, self.updated, self.deleted, self.upserted, self.failed
        )
    }
}

/// One pending write queued in a batch processor
///
/// `many` on updates and deletes selects between the one-document and
/// many-document bulk write models.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOperation {
    /// Insert one document
    Insert {
        /// Document to insert
        document: Document,
    },
    /// Update matching documents
    Update {
        /// Selection filter
        filter: Document,
        /// Update document (`$set`-style operators)
        update: Document,
        /// Insert when nothing matches
        upsert: bool,
        /// Update every match instead of the first
        many: bool,
    },
    /// Delete matching documents
    Delete {
        /// Selection filter
        filter: Document,
        /// Delete every match instead of the first
        many: bool,
    },
    /// Replace one matching document wholesale
    Replace {
        /// Selection filter
        filter: Document,
        /// Replacement document
        replacement: Document,
        /// Insert when nothing matches
        upsert: bool,
    },
}

impl BatchOperation {
    /// Stable name of the operation kind, used for stats and logging
    pub fn kind(&self) -> &'static str {
        match self {
            BatchOperation::Insert { .. } => "insert",
            BatchOperation::Update { .. } => "update",
            BatchOperation::Delete { .. } => "delete",
            BatchOperation::Replace { .. } => "replace",
        }
    }
}

/// Diagnostic execution report for a query
///
/// Produced by the explain path and by the monitor; a ratio of 1.0 means the
/// scan examined nothing beyond what it returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplainReport {
    /// Collection the query ran against
    pub collection: String,
    /// Index that served the query, `None` for a collection scan
    pub index_used: Option<String>,
    /// Server-side execution time in milliseconds
    pub execution_time_ms: u64,
    /// Documents the engine examined
    pub docs_examined: u64,
    /// Documents the query returned
    pub docs_returned: u64,
}

impl ExplainReport {
    /// Efficiency ratio `returned / examined`, 1.0 when nothing was examined
    pub fn efficiency(&self) -> f64 {
        if self.docs_examined == 0 {
            1.0
        } else {
            self.docs_returned as f64 / self.docs_examined as f64
        }
    }

    /// Whether the query was answered without an index
    pub fn is_collection_scan(&self) -> bool {
        self.index_used.is_none()
    }
}

/// Execution options for an aggregation pipeline
///
/// Every pipeline runs with disk spill allowed, a bounded server-side
/// timeout, and a bounded cursor batch size so one heavy aggregation cannot
/// monopolize the store.
#[derive(Debug, Clone)]
pub struct AggregateOptions {
    /// Allow stages to spill to disk
    pub allow_disk_use: bool,
    /// Server-side execution deadline
    pub max_time: Duration,
    /// Cursor batch size
    pub batch_size: u32,
    /// Optional index hint
    pub hint: Option<IndexHint>,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            allow_disk_use: true,
            max_time: Duration::from_secs(30),
            batch_size: 1_000,
            hint: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_query_shape_find_one() {
        let shape = QueryShape::find_one("users", doc! { "user_id": 7 });
        assert_eq!(shape.collection, "users");
        assert_eq!(shape.operation, ReadOperation::FindOne);
        assert!(shape.projection.is_none());
        assert!(shape.limit.is_none());
    }

    #[test]
    fn test_query_shape_find_carries_options() {
        let options = FindOptions::new()
            .projection(doc! { "name": 1 })
            .sort(doc! { "timestamp": -1 })
            .limit(25)
            .skip(5);
        let shape = QueryShape::find("messages", doc! { "channel_id": 3 }, &options);
        assert_eq!(shape.limit, Some(25));
        assert_eq!(shape.skip, Some(5));
        assert_eq!(shape.sort, Some(doc! { "timestamp": -1 }));
    }

    #[test]
    fn test_query_shape_aggregate_folds_stages() {
        let pipeline = vec![doc! { "$match": { "user_id": 7 } }, doc! { "$count": "n" }];
        let shape = QueryShape::aggregate("messages", &pipeline);
        assert_eq!(shape.operation, ReadOperation::Aggregate);
        let stages = shape.filter.get_array("stages").unwrap();
        assert_eq!(stages.len(), 2);
    }

    #[test]
    fn test_write_outcome_count() {
        assert_eq!(WriteOutcome::Inserted(3).count(), 3);
        assert_eq!(WriteOutcome::Updated(1).count(), 1);
        assert_eq!(WriteOutcome::Deleted(0).count(), 0);
        assert_eq!(WriteOutcome::Upserted(2).count(), 2);
    }

    #[test]
    fn test_bulk_summary_merge_offsets_indexes() {
        let mut total = BulkSummary {
            inserted: 10,
            failed: 1,
            errors: vec![BulkWriteFailure {
                index: 4,
                code: None,
                message: "duplicate".into(),
            }],
            ..Default::default()
        };
        let chunk = BulkSummary {
            updated: 2,
            failed: 1,
            errors: vec![BulkWriteFailure {
                index: 1,
                code: Some(11000),
                message: "duplicate".into(),
            }],
            ..Default::default()
        };
        total.merge(chunk, 100);
        assert_eq!(total.total_applied(), 12);
        assert_eq!(total.failed, 2);
        assert_eq!(total.errors[1].index, 101);
    }

    #[test]
    fn test_explain_efficiency() {
        let report = ExplainReport {
            collection: "users".into(),
            index_used: Some("user_id_1".into()),
            execution_time_ms: 4,
            docs_examined: 10,
            docs_returned: 10,
        };
        assert!((report.efficiency() - 1.0).abs() < f64::EPSILON);
        assert!(!report.is_collection_scan());

        let scan = ExplainReport {
            collection: "users".into(),
            index_used: None,
            execution_time_ms: 90,
            docs_examined: 1_000,
            docs_returned: 10,
        };
        assert!((scan.efficiency() - 0.01).abs() < f64::EPSILON);
        assert!(scan.is_collection_scan());
    }

    #[test]
    fn test_explain_efficiency_empty_scan() {
        let report = ExplainReport {
            collection: "users".into(),
            index_used: None,
            execution_time_ms: 0,
            docs_examined: 0,
            docs_returned: 0,
        };
        assert!((report.efficiency() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_batch_operation_kind() {
        let op = BatchOperation::Update {
            filter: doc! { "user_id": 7 },
            update: doc! { "$set": { "name": "x" } },
            upsert: false,
            many: false,
        };
        assert_eq!(op.kind(), "update");
    }
}
