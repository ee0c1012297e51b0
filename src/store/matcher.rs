//! Filter, update, and projection evaluation over BSON documents
//!
//! The in-memory store evaluates the query language itself instead of
//! delegating to a server, so the supported operator surface lives here:
//!
//! - Comparison: `$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`, `$in`, `$nin`
//! - Element: `$exists`, `$regex` (with `$options: "i"`), `$not`
//! - Logical: `$and`, `$or`, `$nor`
//! - Updates: `$set`, `$unset`, `$inc`, `$push`, `$setOnInsert`, replacement
//!
//! Field access understands dotted paths, equality against an array field
//! matches containment, and numeric comparisons work across integer and
//! double representations the way the wire protocol orders them.

use crate::error::StoreError;
use bson::{Bson, Document};
use regex::Regex;
use std::cmp::Ordering;

// ============================================================================
// Field access
// ============================================================================

/// Resolve a possibly dotted path inside a document
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut current: &Bson = doc.get(path.split('.').next()?)?;
    for segment in path.split('.').skip(1) {
        match current {
            Bson::Document(inner) => current = inner.get(segment)?,
            _ => return None,
        }
    }
    Some(current)
}

/// Set a possibly dotted path, creating intermediate documents as needed
pub fn set_path(doc: &mut Document, path: &str, value: Bson) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().unwrap_or(path);
    let mut current = doc;
    for segment in segments {
        if !matches!(current.get(segment), Some(Bson::Document(_))) {
            current.insert(segment, Document::new());
        }
        match current.get_mut(segment) {
            Some(Bson::Document(inner)) => current = inner,
            _ => unreachable!("segment was just replaced with a document"),
        }
    }
    current.insert(last, value);
}

/// Remove a possibly dotted path; returns whether anything was removed
pub fn remove_path(doc: &mut Document, path: &str) -> bool {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().unwrap_or(path);
    let mut current = doc;
    for segment in segments {
        match current.get_mut(segment) {
            Some(Bson::Document(inner)) => current = inner,
            _ => return false,
        }
    }
    current.remove(last).is_some()
}

// ============================================================================
// Value comparison
// ============================================================================

fn numeric(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

/// Equality with cross-type numeric coercion
pub fn values_equal(a: &Bson, b: &Bson) -> bool {
    if let (Some(x), Some(y)) = (numeric(a), numeric(b)) {
        return x == y;
    }
    a == b
}

fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::Null => 0,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => 1,
        Bson::String(_) => 2,
        Bson::Document(_) => 3,
        Bson::Array(_) => 4,
        Bson::ObjectId(_) => 5,
        Bson::Boolean(_) => 6,
        Bson::DateTime(_) => 7,
        _ => 8,
    }
}

/// Total order over BSON values following the wire sort order
///
/// Values of different type families order by type rank, so sorting a mixed
/// collection is deterministic.
pub fn compare_values(a: &Bson, b: &Bson) -> Ordering {
    if let (Some(x), Some(y)) = (numeric(a), numeric(b)) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn ordered_cmp(field: Option<&Bson>, target: &Bson) -> Option<Ordering> {
    let value = field?;
    // Range operators only apply within a comparable type family
    let comparable = numeric(value).is_some() && numeric(target).is_some()
        || type_rank(value) == type_rank(target);
    if !comparable {
        return None;
    }
    Some(compare_values(value, target))
}

// ============================================================================
// Filter matching
// ============================================================================

/// Whether `doc` satisfies `filter`
pub fn matches(doc: &Document, filter: &Document) -> bool {
    for (key, condition) in filter.iter() {
        let ok = match key.as_str() {
            "$and" => logical_clauses(condition).iter().all(|c| matches(doc, c)),
            "$or" => logical_clauses(condition).iter().any(|c| matches(doc, c)),
            "$nor" => !logical_clauses(condition).iter().any(|c| matches(doc, c)),
            _ => field_matches(doc, key, condition),
        };
        if !ok {
            return false;
        }
    }
    true
}

fn logical_clauses(condition: &Bson) -> Vec<&Document> {
    match condition {
        Bson::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Bson::Document(d) => Some(d),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn is_operator_document(value: &Bson) -> bool {
    matches!(value, Bson::Document(d) if d.keys().any(|k| k.starts_with('$')))
}

fn field_matches(doc: &Document, field: &str, condition: &Bson) -> bool {
    // "$options" is a modifier consumed alongside its sibling "$regex"
    if field == "$options" {
        return true;
    }
    let value = get_path(doc, field);
    if is_operator_document(condition) {
        let ops = match condition {
            Bson::Document(d) => d,
            _ => return false,
        };
        ops.iter().all(|(op, operand)| {
            operator_matches(value, op, operand, ops).unwrap_or(false)
        })
    } else {
        equality_matches(value, condition)
    }
}

fn equality_matches(value: Option<&Bson>, target: &Bson) -> bool {
    match value {
        Some(Bson::Array(items)) if !matches!(target, Bson::Array(_)) => {
            items.iter().any(|item| values_equal(item, target))
        }
        Some(v) => values_equal(v, target),
        // Equality against null also matches a missing field
        None => matches!(target, Bson::Null),
    }
}

fn operator_matches(
    value: Option<&Bson>,
    op: &str,
    operand: &Bson,
    siblings: &Document,
) -> Option<bool> {
    let result = match op {
        "$eq" => equality_matches(value, operand),
        "$ne" => !equality_matches(value, operand),
        "$gt" => ordered_cmp(value, operand) == Some(Ordering::Greater),
        "$gte" => matches!(
            ordered_cmp(value, operand),
            Some(Ordering::Greater) | Some(Ordering::Equal)
        ),
        "$lt" => ordered_cmp(value, operand) == Some(Ordering::Less),
        "$lte" => matches!(
            ordered_cmp(value, operand),
            Some(Ordering::Less) | Some(Ordering::Equal)
        ),
        "$in" => match operand {
            Bson::Array(candidates) => candidates
                .iter()
                .any(|candidate| equality_matches(value, candidate)),
            _ => false,
        },
        "$nin" => match operand {
            Bson::Array(candidates) => !candidates
                .iter()
                .any(|candidate| equality_matches(value, candidate)),
            _ => false,
        },
        "$exists" => {
            let wanted = matches!(operand, Bson::Boolean(true))
                || numeric(operand).map(|n| n != 0.0).unwrap_or(false);
            value.is_some() == wanted
        }
        "$regex" => regex_matches(value, operand, siblings.get("$options")),
        "$options" => true,
        "$not" => match operand {
            Bson::Document(inner) => !inner.iter().all(|(inner_op, inner_operand)| {
                operator_matches(value, inner_op, inner_operand, inner).unwrap_or(false)
            }),
            _ => return None,
        },
        _ => return None,
    };
    Some(result)
}

fn regex_matches(value: Option<&Bson>, pattern: &Bson, options: Option<&Bson>) -> bool {
    let pattern = match pattern {
        Bson::String(p) => p.clone(),
        Bson::RegularExpression(re) => re.pattern.clone(),
        _ => return false,
    };
    let case_insensitive = match options {
        Some(Bson::String(opts)) => opts.contains('i'),
        _ => false,
    };
    let full = if case_insensitive {
        format!("(?i){}", pattern)
    } else {
        pattern
    };
    let re = match Regex::new(&full) {
        Ok(re) => re,
        Err(_) => return false,
    };
    match value {
        Some(Bson::String(s)) => re.is_match(s),
        Some(Bson::Array(items)) => items.iter().any(|item| match item {
            Bson::String(s) => re.is_match(s),
            _ => false,
        }),
        _ => false,
    }
}

// ============================================================================
// Update application
// ============================================================================

fn is_update_operators(update: &Document) -> bool {
    update.keys().any(|k| k.starts_with('$'))
}

/// Apply an update document to `doc` in place
///
/// A document with no `$` operators replaces the target wholesale while
/// preserving `_id`. Returns whether anything changed.
pub fn apply_update(doc: &mut Document, update: &Document) -> Result<bool, StoreError> {
    if !is_update_operators(update) {
        let id = doc.get("_id").cloned();
        let before = doc.clone();
        *doc = update.clone();
        if let Some(id) = id {
            if !doc.contains_key("_id") {
                let mut with_id = Document::new();
                with_id.insert("_id", id);
                for (k, v) in update.iter() {
                    with_id.insert(k.clone(), v.clone());
                }
                *doc = with_id;
            }
        }
        return Ok(*doc != before);
    }

    let mut changed = false;
    for (op, spec) in update.iter() {
        let fields = match spec {
            Bson::Document(d) => d,
            _ => {
                return Err(StoreError::InvalidOperation(format!(
                    "update operator {} requires a document operand",
                    op
                )))
            }
        };
        match op.as_str() {
            "$set" => {
                for (path, value) in fields.iter() {
                    if get_path(doc, path) != Some(value) {
                        set_path(doc, path, value.clone());
                        changed = true;
                    }
                }
            }
            "$unset" => {
                for (path, _) in fields.iter() {
                    if remove_path(doc, path) {
                        changed = true;
                    }
                }
            }
            "$inc" => {
                for (path, delta) in fields.iter() {
                    let delta = numeric(delta).ok_or_else(|| {
                        StoreError::InvalidOperation(format!(
                            "$inc on {} requires a numeric operand",
                            path
                        ))
                    })?;
                    let current = get_path(doc, path).and_then(numeric).unwrap_or(0.0);
                    let next = current + delta;
                    // Keep integer representation when both sides are integral
                    let value = if next.fract() == 0.0 && next.abs() < i64::MAX as f64 {
                        Bson::Int64(next as i64)
                    } else {
                        Bson::Double(next)
                    };
                    set_path(doc, path, value);
                    changed = true;
                }
            }
            "$push" => {
                for (path, value) in fields.iter() {
                    match get_path(doc, path) {
                        Some(Bson::Array(_)) => {
                            push_nested(doc, path, value.clone())?;
                            changed = true;
                        }
                        Some(_) => {
                            return Err(StoreError::InvalidOperation(format!(
                                "$push target {} is not an array",
                                path
                            )))
                        }
                        None => {
                            set_path(doc, path, Bson::Array(vec![value.clone()]));
                            changed = true;
                        }
                    }
                }
            }
            "$setOnInsert" => {
                // Only meaningful when an upsert inserts; no-op on existing docs
            }
            other => {
                return Err(StoreError::InvalidOperation(format!(
                    "unsupported update operator {}",
                    other
                )))
            }
        }
    }
    Ok(changed)
}

fn push_nested(doc: &mut Document, path: &str, value: Bson) -> Result<(), StoreError> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().unwrap_or(path);
    let mut current = doc;
    for segment in segments {
        match current.get_mut(segment) {
            Some(Bson::Document(inner)) => current = inner,
            _ => {
                return Err(StoreError::InvalidOperation(format!(
                    "$push path {} does not resolve to a document",
                    path
                )))
            }
        }
    }
    match current.get_mut(last) {
        Some(Bson::Array(items)) => {
            items.push(value);
            Ok(())
        }
        _ => Err(StoreError::InvalidOperation(format!(
            "$push target {} is not an array",
            path
        ))),
    }
}

/// Build the document an upsert inserts when nothing matched
///
/// Seeds from the filter's plain equality fields, then applies `$set` and
/// `$setOnInsert` from the update.
pub fn build_upsert_document(filter: &Document, update: &Document) -> Result<Document, StoreError> {
    let mut doc = Document::new();
    for (field, condition) in filter.iter() {
        if field.starts_with('$') || is_operator_document(condition) {
            continue;
        }
        set_path(&mut doc, field, condition.clone());
    }
    if !is_update_operators(update) {
        for (k, v) in update.iter() {
            doc.insert(k.clone(), v.clone());
        }
        return Ok(doc);
    }
    for op in ["$set", "$setOnInsert"] {
        if let Some(Bson::Document(fields)) = update.get(op) {
            for (path, value) in fields.iter() {
                set_path(&mut doc, path, value.clone());
            }
        }
    }
    if let Some(Bson::Document(fields)) = update.get("$inc") {
        for (path, delta) in fields.iter() {
            set_path(&mut doc, path, delta.clone());
        }
    }
    Ok(doc)
}

// ============================================================================
// Sorting and projection
// ============================================================================

/// Stable multi-key sort following a `{field: 1 | -1}` specification
pub fn sort_documents(docs: &mut [Document], sort: &Document) {
    docs.sort_by(|a, b| {
        for (field, direction) in sort.iter() {
            let descending = numeric(direction).map(|d| d < 0.0).unwrap_or(false);
            let left = get_path(a, field).unwrap_or(&Bson::Null);
            let right = get_path(b, field).unwrap_or(&Bson::Null);
            let ord = compare_values(left, right);
            if ord != Ordering::Equal {
                return if descending { ord.reverse() } else { ord };
            }
        }
        Ordering::Equal
    });
}

/// Apply an inclusion or exclusion projection
pub fn project(doc: &Document, projection: &Document) -> Document {
    let inclusion = projection.iter().any(|(field, value)| {
        field != "_id" && numeric(value).map(|n| n != 0.0).unwrap_or(matches!(value, Bson::Boolean(true)))
    });
    if inclusion {
        let mut out = Document::new();
        let id_excluded = matches!(
            projection.get("_id").and_then(numeric),
            Some(n) if n == 0.0
        ) || projection.get("_id") == Some(&Bson::Boolean(false));
        if !id_excluded {
            if let Some(id) = doc.get("_id") {
                out.insert("_id", id.clone());
            }
        }
        for (field, value) in projection.iter() {
            if field == "_id" {
                continue;
            }
            let wanted =
                numeric(value).map(|n| n != 0.0).unwrap_or(matches!(value, Bson::Boolean(true)));
            if wanted {
                if let Some(found) = get_path(doc, field) {
                    set_path(&mut out, field, found.clone());
                }
            }
        }
        out
    } else {
        let mut out = doc.clone();
        for (field, _) in projection.iter() {
            remove_path(&mut out, field);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn sample() -> Document {
        doc! {
            "_id": 1,
            "user_id": "u-1",
            "score": 42,
            "nested": { "level": 3 },
            "tags": ["alpha", "beta"],
            "name": "Marin",
        }
    }

    #[test]
    fn test_plain_equality() {
        let doc = sample();
        assert!(matches(&doc, &doc! { "user_id": "u-1" }));
        assert!(!matches(&doc, &doc! { "user_id": "u-2" }));
    }

    #[test]
    fn test_cross_type_numeric_equality() {
        let doc = sample();
        assert!(matches(&doc, &doc! { "score": 42_i64 }));
        assert!(matches(&doc, &doc! { "score": 42.0 }));
    }

    #[test]
    fn test_dotted_path() {
        let doc = sample();
        assert!(matches(&doc, &doc! { "nested.level": 3 }));
        assert!(!matches(&doc, &doc! { "nested.level": 4 }));
        assert!(!matches(&doc, &doc! { "nested.missing": 3 }));
    }

    #[test]
    fn test_array_containment() {
        let doc = sample();
        assert!(matches(&doc, &doc! { "tags": "alpha" }));
        assert!(!matches(&doc, &doc! { "tags": "gamma" }));
    }

    #[test]
    fn test_range_operators() {
        let doc = sample();
        assert!(matches(&doc, &doc! { "score": { "$gt": 40 } }));
        assert!(matches(&doc, &doc! { "score": { "$gte": 42, "$lte": 42 } }));
        assert!(!matches(&doc, &doc! { "score": { "$lt": 42 } }));
    }

    #[test]
    fn test_range_ignores_incomparable_types() {
        let doc = sample();
        assert!(!matches(&doc, &doc! { "name": { "$gt": 10 } }));
    }

    #[test]
    fn test_in_nin() {
        let doc = sample();
        assert!(matches(&doc, &doc! { "user_id": { "$in": ["u-1", "u-9"] } }));
        assert!(!matches(&doc, &doc! { "user_id": { "$nin": ["u-1"] } }));
        assert!(matches(&doc, &doc! { "tags": { "$in": ["beta"] } }));
        // $nin also matches when the field is absent
        assert!(matches(&doc, &doc! { "missing": { "$nin": ["x"] } }));
    }

    #[test]
    fn test_exists() {
        let doc = sample();
        assert!(matches(&doc, &doc! { "score": { "$exists": true } }));
        assert!(matches(&doc, &doc! { "missing": { "$exists": false } }));
        assert!(!matches(&doc, &doc! { "missing": { "$exists": true } }));
    }

    #[test]
    fn test_ne_matches_missing_field() {
        let doc = sample();
        assert!(matches(&doc, &doc! { "missing": { "$ne": "x" } }));
        assert!(!matches(&doc, &doc! { "user_id": { "$ne": "u-1" } }));
    }

    #[test]
    fn test_null_equality_matches_missing() {
        let doc = sample();
        assert!(matches(&doc, &doc! { "missing": Bson::Null }));
    }

    #[test]
    fn test_regex_case_insensitive() {
        let doc = sample();
        assert!(matches(&doc, &doc! { "name": { "$regex": "^mar", "$options": "i" } }));
        assert!(!matches(&doc, &doc! { "name": { "$regex": "^mar" } }));
    }

    #[test]
    fn test_logical_operators() {
        let doc = sample();
        assert!(matches(
            &doc,
            &doc! { "$or": [ { "score": 0 }, { "user_id": "u-1" } ] }
        ));
        assert!(matches(
            &doc,
            &doc! { "$and": [ { "score": { "$gt": 0 } }, { "tags": "alpha" } ] }
        ));
        assert!(matches(&doc, &doc! { "$nor": [ { "score": 0 }, { "user_id": "u-9" } ] }));
    }

    #[test]
    fn test_not_operator() {
        let doc = sample();
        assert!(matches(&doc, &doc! { "score": { "$not": { "$gt": 100 } } }));
        assert!(!matches(&doc, &doc! { "score": { "$not": { "$gt": 10 } } }));
    }

    #[test]
    fn test_apply_set_and_inc() {
        let mut doc = sample();
        let changed = apply_update(
            &mut doc,
            &doc! { "$set": { "name": "Rin" }, "$inc": { "score": 8 } },
        )
        .unwrap();
        assert!(changed);
        assert_eq!(doc.get_str("name").unwrap(), "Rin");
        assert_eq!(doc.get_i64("score").unwrap(), 50);
    }

    #[test]
    fn test_apply_set_dotted_creates_intermediates() {
        let mut doc = doc! { "_id": 1 };
        apply_update(&mut doc, &doc! { "$set": { "meta.source.kind": "api" } }).unwrap();
        assert_eq!(
            get_path(&doc, "meta.source.kind"),
            Some(&Bson::String("api".into()))
        );
    }

    #[test]
    fn test_apply_unset() {
        let mut doc = sample();
        let changed = apply_update(&mut doc, &doc! { "$unset": { "name": "" } }).unwrap();
        assert!(changed);
        assert!(!doc.contains_key("name"));
    }

    #[test]
    fn test_apply_push() {
        let mut doc = sample();
        apply_update(&mut doc, &doc! { "$push": { "tags": "gamma" } }).unwrap();
        assert_eq!(doc.get_array("tags").unwrap().len(), 3);

        let mut fresh = doc! { "_id": 2 };
        apply_update(&mut fresh, &doc! { "$push": { "tags": "first" } }).unwrap();
        assert_eq!(fresh.get_array("tags").unwrap().len(), 1);
    }

    #[test]
    fn test_push_non_array_rejected() {
        let mut doc = sample();
        let err = apply_update(&mut doc, &doc! { "$push": { "name": "x" } }).unwrap_err();
        assert!(matches!(err, StoreError::InvalidOperation(_)));
    }

    #[test]
    fn test_replacement_preserves_id() {
        let mut doc = sample();
        apply_update(&mut doc, &doc! { "name": "fresh" }).unwrap();
        assert_eq!(doc.get_i32("_id").unwrap(), 1);
        assert_eq!(doc.get_str("name").unwrap(), "fresh");
        assert!(!doc.contains_key("score"));
    }

    #[test]
    fn test_upsert_document_seeds_filter_and_set_on_insert() {
        let built = build_upsert_document(
            &doc! { "user_id": "u-1", "score": { "$gt": 5 } },
            &doc! { "$set": { "name": "x" }, "$setOnInsert": { "created": true } },
        )
        .unwrap();
        assert_eq!(built.get_str("user_id").unwrap(), "u-1");
        assert_eq!(built.get_str("name").unwrap(), "x");
        assert_eq!(built.get_bool("created").unwrap(), true);
        // Operator conditions never seed fields
        assert!(!built.contains_key("score"));
    }

    #[test]
    fn test_sort_documents_multi_key() {
        let mut docs = vec![
            doc! { "a": 2, "b": 1 },
            doc! { "a": 1, "b": 2 },
            doc! { "a": 1, "b": 1 },
        ];
        sort_documents(&mut docs, &doc! { "a": 1, "b": -1 });
        assert_eq!(docs[0].get_i32("b").unwrap(), 2);
        assert_eq!(docs[1].get_i32("b").unwrap(), 1);
        assert_eq!(docs[2].get_i32("a").unwrap(), 2);
    }

    #[test]
    fn test_sort_missing_fields_first_ascending() {
        let mut docs = vec![doc! { "a": 1 }, doc! {}];
        sort_documents(&mut docs, &doc! { "a": 1 });
        assert!(!docs[0].contains_key("a"));
    }

    #[test]
    fn test_projection_inclusion() {
        let doc = sample();
        let projected = project(&doc, &doc! { "name": 1, "score": 1 });
        assert_eq!(projected.len(), 3);
        assert!(projected.contains_key("_id"));
        assert!(projected.contains_key("name"));
        assert!(!projected.contains_key("tags"));
    }

    #[test]
    fn test_projection_inclusion_without_id() {
        let doc = sample();
        let projected = project(&doc, &doc! { "name": 1, "_id": 0 });
        assert_eq!(projected.len(), 1);
        assert!(!projected.contains_key("_id"));
    }

    #[test]
    fn test_projection_exclusion() {
        let doc = sample();
        let projected = project(&doc, &doc! { "tags": 0, "nested": 0 });
        assert!(projected.contains_key("_id"));
        assert!(projected.contains_key("name"));
        assert!(!projected.contains_key("tags"));
    }
}
