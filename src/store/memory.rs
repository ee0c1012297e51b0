//! In-memory document store
//!
//! A process-local [`DocumentStore`] holding collections as vectors of BSON
//! documents. It evaluates filters, updates, aggregation pipelines, and
//! index DDL through [`matcher`](super::matcher), which makes it a faithful
//! stand-in for a wire-connected store in tests and embedded deployments:
//!
//! - `_id` uniqueness and unique secondary indexes are enforced
//! - Aggregations support `$match`, `$group`, `$project`, `$sort`, `$skip`,
//!   `$limit`, and `$count` with the accumulator set the template library
//!   emits
//! - Explain reports are simulated from the registered indexes
//! - Faults can be injected (single-shot errors, a persistent offline flag)
//!   to exercise retry and reconnect paths

use crate::error::StoreError;
use crate::store::matcher;
use crate::store::traits::{DocumentStore, IndexModel};
use crate::types::{
    AggregateOptions, BatchOperation, BulkSummary, BulkWriteFailure, ExplainReport, FindOptions,
    WriteOutcome,
};
use async_trait::async_trait;
use bson::{doc, oid::ObjectId, Bson, Document};
use chrono::Timelike;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Operation counters, readable from tests
#[derive(Debug, Default)]
pub struct StoreCounters {
    /// find / find_one / count commands served
    pub finds: AtomicU64,
    /// Aggregation pipelines served
    pub aggregates: AtomicU64,
    /// Single-document write commands served
    pub writes: AtomicU64,
    /// Bulk write commands served (one per command, not per operation)
    pub bulk_writes: AtomicU64,
    /// Liveness probes served
    pub pings: AtomicU64,
}

#[derive(Debug, Default)]
struct Collection {
    documents: Vec<Document>,
    indexes: Vec<IndexModel>,
}

impl Collection {
    fn index_names(&self) -> Vec<String> {
        let mut names = vec!["_id_".to_string()];
        names.extend(self.indexes.iter().map(|ix| ix.effective_name()));
        names
    }
}

/// Process-local document store
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Collection>>,
    fail_next: Mutex<Option<StoreError>>,
    offline: AtomicBool,
    /// Command counters for assertions and diagnostics
    pub counters: StoreCounters,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            fail_next: Mutex::new(None),
            offline: AtomicBool::new(false),
            counters: StoreCounters::default(),
        }
    }

    /// Make the next command fail with `error`
    pub fn fail_next(&self, error: StoreError) {
        *self.fail_next.lock() = Some(error);
    }

    /// Simulate losing or regaining the connection
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Raw contents of a collection, in insertion order
    pub fn dump(&self, collection: &str) -> Vec<Document> {
        self.collections
            .lock()
            .get(collection)
            .map(|c| c.documents.clone())
            .unwrap_or_default()
    }

    fn guard(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionLost(
                "store is offline".to_string(),
            ));
        }
        if let Some(err) = self.fail_next.lock().take() {
            return Err(err);
        }
        Ok(())
    }

    fn unique_violation(
        collection: &Collection,
        name: &str,
        candidate: &Document,
        skip_position: Option<usize>,
    ) -> Result<(), StoreError> {
        if let Some(id) = candidate.get("_id") {
            for (pos, existing) in collection.documents.iter().enumerate() {
                if Some(pos) == skip_position {
                    continue;
                }
                if existing
                    .get("_id")
                    .map(|e| matcher::values_equal(e, id))
                    .unwrap_or(false)
                {
                    return Err(StoreError::DuplicateKey {
                        collection: name.to_string(),
                        key: format!("_id={}", id),
                    });
                }
            }
        }
        for index in collection.indexes.iter().filter(|ix| ix.unique) {
            let fields: Vec<&String> = index.keys.keys().collect();
            let values: Vec<Option<&Bson>> = fields
                .iter()
                .map(|f| matcher::get_path(candidate, f))
                .collect();
            if index.sparse && values.iter().all(|v| v.is_none()) {
                continue;
            }
            for (pos, existing) in collection.documents.iter().enumerate() {
                if Some(pos) == skip_position {
                    continue;
                }
                let clash = fields.iter().zip(values.iter()).all(|(f, v)| {
                    match (matcher::get_path(existing, f), v) {
                        (Some(a), Some(b)) => matcher::values_equal(a, b),
                        (None, None) => true,
                        _ => false,
                    }
                });
                if clash {
                    let key = fields
                        .iter()
                        .zip(values.iter())
                        .map(|(f, v)| {
                            format!("{}={}", f, v.map(|b| b.to_string()).unwrap_or_default())
                        })
                        .collect::<Vec<_>>()
                        .join(",");
                    return Err(StoreError::DuplicateKey {
                        collection: name.to_string(),
                        key,
                    });
                }
            }
        }
        Ok(())
    }

    fn insert_into(
        collection: &mut Collection,
        name: &str,
        mut document: Document,
    ) -> Result<WriteOutcome, StoreError> {
        if !document.contains_key("_id") {
            let mut with_id = doc! { "_id": ObjectId::new() };
            for (k, v) in document.iter() {
                with_id.insert(k.clone(), v.clone());
            }
            document = with_id;
        }
        Self::unique_violation(collection, name, &document, None)?;
        collection.documents.push(document);
        Ok(WriteOutcome::Inserted(1))
    }

    fn apply_one(
        collection: &mut Collection,
        name: &str,
        op: &BatchOperation,
    ) -> Result<WriteOutcome, StoreError> {
        match op {
            BatchOperation::Insert { document } => {
                Self::insert_into(collection, name, document.clone())
            }
            BatchOperation::Update {
                filter,
                update,
                upsert,
                many,
            } => {
                let positions: Vec<usize> = collection
                    .documents
                    .iter()
                    .enumerate()
                    .filter(|(_, d)| matcher::matches(d, filter))
                    .map(|(i, _)| i)
                    .collect();
                if positions.is_empty() {
                    if *upsert {
                        let fresh = matcher::build_upsert_document(filter, update)?;
                        Self::insert_into(collection, name, fresh)?;
                        return Ok(WriteOutcome::Upserted(1));
                    }
                    return Ok(WriteOutcome::Updated(0));
                }
                let targets: Vec<usize> = if *many {
                    positions
                } else {
                    vec![positions[0]]
                };
                let mut modified = 0;
                for pos in targets {
                    let mut updated = collection.documents[pos].clone();
                    if matcher::apply_update(&mut updated, update)? {
                        Self::unique_violation(collection, name, &updated, Some(pos))?;
                        collection.documents[pos] = updated;
                        modified += 1;
                    }
                }
                Ok(WriteOutcome::Updated(modified))
            }
            BatchOperation::Delete { filter, many } => {
                let mut removed = 0;
                let mut kept = Vec::with_capacity(collection.documents.len());
                for doc in collection.documents.drain(..) {
                    let hit = matcher::matches(&doc, filter);
                    if hit && (*many || removed == 0) {
                        removed += 1;
                    } else {
                        kept.push(doc);
                    }
                }
                collection.documents = kept;
                Ok(WriteOutcome::Deleted(removed))
            }
            BatchOperation::Replace {
                filter,
                replacement,
                upsert,
            } => {
                let position = collection
                    .documents
                    .iter()
                    .position(|d| matcher::matches(d, filter));
                match position {
                    Some(pos) => {
                        let mut updated = collection.documents[pos].clone();
                        matcher::apply_update(&mut updated, replacement)?;
                        Self::unique_violation(collection, name, &updated, Some(pos))?;
                        collection.documents[pos] = updated;
                        Ok(WriteOutcome::Updated(1))
                    }
                    None if *upsert => {
                        let fresh = matcher::build_upsert_document(filter, replacement)?;
                        Self::insert_into(collection, name, fresh)?;
                        Ok(WriteOutcome::Upserted(1))
                    }
                    None => Ok(WriteOutcome::Updated(0)),
                }
            }
        }
    }

    fn select_index(collection: &Collection, filter: &Document, sort: Option<&Document>) -> Option<String> {
        let filter_fields: Vec<&String> =
            filter.keys().filter(|k| !k.starts_with('$')).collect();
        for index in &collection.indexes {
            if let Some((leading, _)) = index.keys.iter().next() {
                if filter_fields.iter().any(|f| *f == leading) {
                    return Some(index.effective_name());
                }
                if let Some(sort) = sort {
                    if sort.keys().next().map(|k| k == leading).unwrap_or(false) {
                        return Some(index.effective_name());
                    }
                }
            }
        }
        if filter_fields.iter().any(|f| f.as_str() == "_id") {
            return Some("_id_".to_string());
        }
        None
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.guard()?;
        self.counters.pings.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
        projection: Option<Document>,
    ) -> Result<Option<Document>, StoreError> {
        self.guard()?;
        self.counters.finds.fetch_add(1, Ordering::Relaxed);
        let collections = self.collections.lock();
        let found = collections
            .get(collection)
            .and_then(|c| c.documents.iter().find(|d| matcher::matches(d, &filter)))
            .cloned();
        Ok(found.map(|d| match &projection {
            Some(p) => matcher::project(&d, p),
            None => d,
        }))
    }

    async fn find(
        &self,
        collection: &str,
        filter: Document,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError> {
        self.guard()?;
        self.counters.finds.fetch_add(1, Ordering::Relaxed);
        let collections = self.collections.lock();
        let mut results: Vec<Document> = collections
            .get(collection)
            .map(|c| {
                c.documents
                    .iter()
                    .filter(|d| matcher::matches(d, &filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if let Some(sort) = &options.sort {
            matcher::sort_documents(&mut results, sort);
        }
        if let Some(skip) = options.skip {
            let skip = skip.min(results.len() as u64) as usize;
            results.drain(..skip);
        }
        if let Some(limit) = options.limit {
            results.truncate(limit.max(0) as usize);
        }
        if let Some(projection) = &options.projection {
            results = results
                .iter()
                .map(|d| matcher::project(d, projection))
                .collect();
        }
        Ok(results)
    }

    async fn count(&self, collection: &str, filter: Document) -> Result<u64, StoreError> {
        self.guard()?;
        self.counters.finds.fetch_add(1, Ordering::Relaxed);
        let collections = self.collections.lock();
        Ok(collections
            .get(collection)
            .map(|c| {
                c.documents
                    .iter()
                    .filter(|d| matcher::matches(d, &filter))
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
        _options: &AggregateOptions,
    ) -> Result<Vec<Document>, StoreError> {
        self.guard()?;
        self.counters.aggregates.fetch_add(1, Ordering::Relaxed);
        let snapshot: Vec<Document> = {
            let collections = self.collections.lock();
            collections
                .get(collection)
                .map(|c| c.documents.clone())
                .unwrap_or_default()
        };
        run_pipeline(snapshot, &pipeline)
    }

    async fn insert_one(
        &self,
        collection: &str,
        document: Document,
    ) -> Result<WriteOutcome, StoreError> {
        self.guard()?;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        let mut collections = self.collections.lock();
        let entry = collections.entry(collection.to_string()).or_default();
        Self::insert_into(entry, collection, document)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> Result<WriteOutcome, StoreError> {
        self.guard()?;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        let mut collections = self.collections.lock();
        let entry = collections.entry(collection.to_string()).or_default();
        Self::apply_one(
            entry,
            collection,
            &BatchOperation::Update {
                filter,
                update,
                upsert,
                many: false,
            },
        )
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> Result<WriteOutcome, StoreError> {
        self.guard()?;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        let mut collections = self.collections.lock();
        let entry = collections.entry(collection.to_string()).or_default();
        Self::apply_one(
            entry,
            collection,
            &BatchOperation::Update {
                filter,
                update,
                upsert: false,
                many: true,
            },
        )
    }

    async fn delete_one(
        &self,
        collection: &str,
        filter: Document,
    ) -> Result<WriteOutcome, StoreError> {
        self.guard()?;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        let mut collections = self.collections.lock();
        let entry = collections.entry(collection.to_string()).or_default();
        Self::apply_one(entry, collection, &BatchOperation::Delete { filter, many: false })
    }

    async fn delete_many(
        &self,
        collection: &str,
        filter: Document,
    ) -> Result<WriteOutcome, StoreError> {
        self.guard()?;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        let mut collections = self.collections.lock();
        let entry = collections.entry(collection.to_string()).or_default();
        Self::apply_one(entry, collection, &BatchOperation::Delete { filter, many: true })
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: Document,
        replacement: Document,
        upsert: bool,
    ) -> Result<WriteOutcome, StoreError> {
        self.guard()?;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        let mut collections = self.collections.lock();
        let entry = collections.entry(collection.to_string()).or_default();
        Self::apply_one(
            entry,
            collection,
            &BatchOperation::Replace {
                filter,
                replacement,
                upsert,
            },
        )
    }

    async fn bulk_write(
        &self,
        collection: &str,
        operations: &[BatchOperation],
    ) -> Result<BulkSummary, StoreError> {
        self.guard()?;
        self.counters.bulk_writes.fetch_add(1, Ordering::Relaxed);
        let mut collections = self.collections.lock();
        let entry = collections.entry(collection.to_string()).or_default();
        let mut summary = BulkSummary::new();
        for (index, op) in operations.iter().enumerate() {
            match Self::apply_one(entry, collection, op) {
                Ok(outcome) => summary.absorb(outcome),
                Err(err) => {
                    summary.failed += 1;
                    summary.errors.push(BulkWriteFailure {
                        index,
                        code: match &err {
                            StoreError::DuplicateKey { .. } => Some(11000),
                            _ => None,
                        },
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok(summary)
    }

    async fn explain_find(
        &self,
        collection: &str,
        filter: Document,
        options: &FindOptions,
    ) -> Result<ExplainReport, StoreError> {
        self.guard()?;
        let collections = self.collections.lock();
        let (total, matched, index_used) = match collections.get(collection) {
            Some(c) => {
                let matched = c
                    .documents
                    .iter()
                    .filter(|d| matcher::matches(d, &filter))
                    .count() as u64;
                (
                    c.documents.len() as u64,
                    matched,
                    Self::select_index(c, &filter, options.sort.as_ref()),
                )
            }
            None => (0, 0, None),
        };
        let returned = match options.limit {
            Some(limit) => matched.min(limit.max(0) as u64),
            None => matched,
        };
        let examined = if index_used.is_some() { matched } else { total };
        Ok(ExplainReport {
            collection: collection.to_string(),
            index_used,
            execution_time_ms: if examined > 1_000 { examined / 1_000 } else { 0 },
            docs_examined: examined,
            docs_returned: returned,
        })
    }

    async fn list_index_names(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        self.guard()?;
        let collections = self.collections.lock();
        Ok(collections
            .get(collection)
            .map(|c| c.index_names())
            .unwrap_or_else(|| vec!["_id_".to_string()]))
    }

    async fn create_index(
        &self,
        collection: &str,
        index: &IndexModel,
    ) -> Result<String, StoreError> {
        self.guard()?;
        let mut collections = self.collections.lock();
        let entry = collections.entry(collection.to_string()).or_default();
        let name = index.effective_name();
        if !entry.indexes.iter().any(|ix| ix.effective_name() == name) {
            entry.indexes.push(index.clone());
        }
        Ok(name)
    }
}

// ============================================================================
// Aggregation pipeline evaluation
// ============================================================================

fn run_pipeline(mut docs: Vec<Document>, pipeline: &[Document]) -> Result<Vec<Document>, StoreError> {
    for stage in pipeline {
        let (name, spec) = stage
            .iter()
            .next()
            .ok_or_else(|| StoreError::InvalidOperation("empty pipeline stage".to_string()))?;
        docs = match (name.as_str(), spec) {
            ("$match", Bson::Document(filter)) => docs
                .into_iter()
                .filter(|d| matcher::matches(d, filter))
                .collect(),
            ("$group", Bson::Document(group)) => run_group(&docs, group)?,
            ("$project", Bson::Document(projection)) => docs
                .iter()
                .map(|d| run_project(d, projection))
                .collect(),
            ("$sort", Bson::Document(sort)) => {
                matcher::sort_documents(&mut docs, sort);
                docs
            }
            ("$skip", value) => {
                let skip = bson_u64(value).unwrap_or(0).min(docs.len() as u64) as usize;
                docs.drain(..skip);
                docs
            }
            ("$limit", value) => {
                let limit = bson_u64(value).unwrap_or(0) as usize;
                docs.truncate(limit);
                docs
            }
            ("$count", Bson::String(field)) => {
                let mut counted = Document::new();
                counted.insert(field.clone(), docs.len() as i64);
                vec![counted]
            }
            (other, _) => {
                return Err(StoreError::Unsupported(format!(
                    "aggregation stage {} is not supported",
                    other
                )))
            }
        };
    }
    Ok(docs)
}

fn bson_u64(value: &Bson) -> Option<u64> {
    match value {
        Bson::Int32(n) if *n >= 0 => Some(*n as u64),
        Bson::Int64(n) if *n >= 0 => Some(*n as u64),
        Bson::Double(n) if *n >= 0.0 => Some(*n as u64),
        _ => None,
    }
}

/// Evaluate an aggregation expression against one document
fn eval_expr(doc: &Document, expr: &Bson) -> Bson {
    match expr {
        Bson::String(s) if s.starts_with('$') => matcher::get_path(doc, &s[1..])
            .cloned()
            .unwrap_or(Bson::Null),
        Bson::Document(inner) => {
            if let Some(spec) = inner.get("$dateToString") {
                return eval_date_to_string(doc, spec);
            }
            if let Some(date) = inner.get("$hour") {
                return match eval_expr(doc, date) {
                    Bson::DateTime(dt) => Bson::Int32(dt.to_chrono().hour() as i32),
                    _ => Bson::Null,
                };
            }
            if let Some(target) = inner.get("$size") {
                return match eval_expr(doc, target) {
                    Bson::Array(items) => Bson::Int32(items.len() as i32),
                    _ => Bson::Null,
                };
            }
            let mut out = Document::new();
            for (k, v) in inner.iter() {
                out.insert(k.clone(), eval_expr(doc, v));
            }
            Bson::Document(out)
        }
        other => other.clone(),
    }
}

fn eval_date_to_string(doc: &Document, spec: &Bson) -> Bson {
    let spec = match spec {
        Bson::Document(d) => d,
        _ => return Bson::Null,
    };
    let format = match spec.get_str("format") {
        Ok(f) => f,
        Err(_) => return Bson::Null,
    };
    let date = match spec.get("date") {
        Some(expr) => eval_expr(doc, expr),
        None => return Bson::Null,
    };
    match date {
        Bson::DateTime(dt) => Bson::String(dt.to_chrono().format(format).to_string()),
        _ => Bson::Null,
    }
}

enum Accumulator {
    Sum(f64, bool),
    Avg(f64, u64),
    Min(Option<Bson>),
    Max(Option<Bson>),
    First(Option<Bson>),
    Push(Vec<Bson>),
    AddToSet(Vec<Bson>),
}

impl Accumulator {
    fn feed(&mut self, value: Bson) {
        match self {
            Accumulator::Sum(total, integral) => {
                if let Bson::Double(_) = value {
                    *integral = false;
                }
                if let Some(n) = bson_f64(&value) {
                    *total += n;
                }
            }
            Accumulator::Avg(total, count) => {
                if let Some(n) = bson_f64(&value) {
                    *total += n;
                    *count += 1;
                }
            }
            Accumulator::Min(current) => {
                let smaller = match current {
                    Some(c) => matcher::compare_values(&value, c) == std::cmp::Ordering::Less,
                    None => true,
                };
                if smaller && value != Bson::Null {
                    *current = Some(value);
                }
            }
            Accumulator::Max(current) => {
                let larger = match current {
                    Some(c) => matcher::compare_values(&value, c) == std::cmp::Ordering::Greater,
                    None => true,
                };
                if larger && value != Bson::Null {
                    *current = Some(value);
                }
            }
            Accumulator::First(current) => {
                if current.is_none() {
                    *current = Some(value);
                }
            }
            Accumulator::Push(items) => items.push(value),
            Accumulator::AddToSet(items) => {
                if !items.iter().any(|i| matcher::values_equal(i, &value)) {
                    items.push(value);
                }
            }
        }
    }

    fn finish(self) -> Bson {
        match self {
            Accumulator::Sum(total, integral) => {
                if integral && total.fract() == 0.0 {
                    Bson::Int64(total as i64)
                } else {
                    Bson::Double(total)
                }
            }
            Accumulator::Avg(total, count) => {
                if count == 0 {
                    Bson::Null
                } else {
                    Bson::Double(total / count as f64)
                }
            }
            Accumulator::Min(v) | Accumulator::Max(v) | Accumulator::First(v) => {
                v.unwrap_or(Bson::Null)
            }
            Accumulator::Push(items) | Accumulator::AddToSet(items) => Bson::Array(items),
        }
    }
}

fn bson_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

fn new_accumulator(op: &str) -> Result<Accumulator, StoreError> {
    Ok(match op {
        "$sum" => Accumulator::Sum(0.0, true),
        "$avg" => Accumulator::Avg(0.0, 0),
        "$min" => Accumulator::Min(None),
        "$max" => Accumulator::Max(None),
        "$first" => Accumulator::First(None),
        "$push" => Accumulator::Push(Vec::new()),
        "$addToSet" => Accumulator::AddToSet(Vec::new()),
        other => {
            return Err(StoreError::Unsupported(format!(
                "group accumulator {} is not supported",
                other
            )))
        }
    })
}

fn run_group(docs: &[Document], group: &Document) -> Result<Vec<Document>, StoreError> {
    let key_expr = group
        .get("_id")
        .ok_or_else(|| StoreError::InvalidOperation("$group requires an _id".to_string()))?;

    struct GroupState {
        key: Bson,
        fields: Vec<(String, Accumulator)>,
    }

    let field_specs: Vec<(&String, &Document, &String, &Bson)> = group
        .iter()
        .filter(|(name, _)| name.as_str() != "_id")
        .map(|(name, spec)| match spec {
            Bson::Document(acc) => match acc.iter().next() {
                Some((op, operand)) => Ok((name, acc, op, operand)),
                None => Err(StoreError::InvalidOperation(format!(
                    "group field {} has no accumulator",
                    name
                ))),
            },
            _ => Err(StoreError::InvalidOperation(format!(
                "group field {} must be an accumulator document",
                name
            ))),
        })
        .collect::<Result<_, _>>()?;

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, GroupState> = HashMap::new();

    for doc in docs {
        let key = eval_expr(doc, key_expr);
        let map_key = format!("{:?}", key);
        if !groups.contains_key(&map_key) {
            let mut fields = Vec::with_capacity(field_specs.len());
            for (name, _, op, _) in &field_specs {
                fields.push(((*name).clone(), new_accumulator(op)?));
            }
            order.push(map_key.clone());
            groups.insert(map_key.clone(), GroupState { key, fields });
        }
        let state = groups.get_mut(&map_key).unwrap();
        for (slot, (_, _, _, operand)) in state.fields.iter_mut().zip(field_specs.iter()) {
            slot.1.feed(eval_expr(doc, operand));
        }
    }

    let mut out = Vec::with_capacity(order.len());
    for map_key in order {
        let state = groups.remove(&map_key).unwrap();
        let mut result = Document::new();
        result.insert("_id", state.key);
        for (name, acc) in state.fields {
            result.insert(name, acc.finish());
        }
        out.push(result);
    }
    Ok(out)
}

fn run_project(doc: &Document, projection: &Document) -> Document {
    let computed = projection
        .iter()
        .any(|(_, v)| matches!(v, Bson::String(_) | Bson::Document(_)));
    if !computed {
        return matcher::project(doc, projection);
    }
    let mut out = Document::new();
    let id_excluded = matches!(projection.get("_id"), Some(Bson::Int32(0)))
        || matches!(projection.get("_id"), Some(Bson::Int64(0)))
        || matches!(projection.get("_id"), Some(Bson::Boolean(false)));
    if !id_excluded {
        if let Some(id) = doc.get("_id") {
            out.insert("_id", id.clone());
        }
    }
    for (field, spec) in projection.iter() {
        if field == "_id" {
            continue;
        }
        match spec {
            Bson::Int32(1) | Bson::Int64(1) | Bson::Boolean(true) => {
                if let Some(value) = matcher::get_path(doc, field) {
                    matcher::set_path(&mut out, field, value.clone());
                }
            }
            Bson::Int32(0) | Bson::Int64(0) | Bson::Boolean(false) => {}
            expr => {
                out.insert(field.clone(), eval_expr(doc, expr));
            }
        }
    }
    out
}
