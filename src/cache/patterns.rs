//! Invalidation pattern derivation
//!
//! Cached entries and writes are bridged by string patterns. A read entry is
//! indexed under `collection:<name>` plus one `<field>:<value>` pattern per
//! identity field its filter pins. A write derives patterns from its filter
//! and its payload: when it pins identity fields the invalidation is targeted
//! (and reaches entries in *other* collections filtered on the same entity);
//! when it pins nothing the whole collection's entries are dropped.

use crate::types::BatchOperation;
use bson::{Bson, Document};
use std::collections::BTreeSet;

/// Fields that identify an entity; values of these participate in patterns
pub static IDENTITY_FIELDS: &[&str] = &[
    "_id",
    "user_id",
    "owner_id",
    "channel_id",
    "message_id",
    "guild_id",
];

/// Free-text fields recognized by classification and the optimizer's
/// prefix-search rewrite
pub static FREE_TEXT_FIELDS: &[&str] = &["username", "name", "title", "content", "description"];

/// Render a scalar into its pattern token
///
/// Integral doubles collapse to the integer rendering so `7_i32`, `7_i64`,
/// and `7.0` all produce the same token.
pub fn scalar_token(value: &Bson) -> Option<String> {
    match value {
        Bson::String(s) => Some(s.clone()),
        Bson::Int32(n) => Some(n.to_string()),
        Bson::Int64(n) => Some(n.to_string()),
        Bson::Double(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => {
            Some((*n as i64).to_string())
        }
        Bson::Double(n) => Some(n.to_string()),
        Bson::ObjectId(oid) => Some(oid.to_hex()),
        Bson::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Whether a filter pins at least one identity field to a concrete value
pub fn has_identity_equality(filter: &Document) -> bool {
    IDENTITY_FIELDS.iter().any(|field| {
        filter
            .get(*field)
            .map(|value| match value {
                Bson::Document(ops) => ops.get("$eq").and_then(scalar_token).is_some(),
                other => scalar_token(other).is_some(),
            })
            .unwrap_or(false)
    })
}

fn collect_identity(doc: &Document, out: &mut BTreeSet<String>) {
    for field in IDENTITY_FIELDS {
        let value = match doc.get(*field) {
            Some(v) => v,
            None => continue,
        };
        match value {
            Bson::Document(ops) => {
                if let Some(token) = ops.get("$eq").and_then(scalar_token) {
                    out.insert(format!("{}:{}", field, token));
                }
                if let Some(Bson::Array(items)) = ops.get("$in") {
                    for item in items {
                        if let Some(token) = scalar_token(item) {
                            out.insert(format!("{}:{}", field, token));
                        }
                    }
                }
            }
            other => {
                if let Some(token) = scalar_token(other) {
                    out.insert(format!("{}:{}", field, token));
                }
            }
        }
    }
}

fn collect_update_payload(update: &Document, out: &mut BTreeSet<String>) {
    let has_operators = update.keys().any(|k| k.starts_with('$'));
    if !has_operators {
        collect_identity(update, out);
        return;
    }
    for op in ["$set", "$setOnInsert"] {
        if let Some(Bson::Document(fields)) = update.get(op) {
            collect_identity(fields, out);
        }
    }
}

/// Patterns a cached read entry is indexed under
pub fn patterns_for_read(collection: &str, filter: &Document) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    out.insert(format!("collection:{}", collection));
    collect_identity(filter, &mut out);
    out
}

/// Patterns a write invalidates
///
/// Targeted when identity fields are pinned, otherwise the whole collection.
pub fn patterns_for_write(
    collection: &str,
    filter: &Document,
    update: Option<&Document>,
) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_identity(filter, &mut out);
    if let Some(update) = update {
        collect_update_payload(update, &mut out);
    }
    if out.is_empty() {
        out.insert(format!("collection:{}", collection));
    }
    out
}

/// Patterns an insert invalidates
pub fn patterns_for_insert(collection: &str, document: &Document) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_identity(document, &mut out);
    if out.is_empty() {
        out.insert(format!("collection:{}", collection));
    }
    out
}

/// Patterns one queued batch operation invalidates once executed
pub fn patterns_for_operation(collection: &str, op: &BatchOperation) -> BTreeSet<String> {
    match op {
        BatchOperation::Insert { document } => patterns_for_insert(collection, document),
        BatchOperation::Update { filter, update, .. } => {
            patterns_for_write(collection, filter, Some(update))
        }
        BatchOperation::Delete { filter, .. } => patterns_for_write(collection, filter, None),
        BatchOperation::Replace {
            filter,
            replacement,
            ..
        } => patterns_for_write(collection, filter, Some(replacement)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_read_patterns_include_collection_and_identity() {
        let patterns = patterns_for_read("messages", &doc! { "user_id": 7, "flagged": true });
        assert!(patterns.contains("collection:messages"));
        assert!(patterns.contains("user_id:7"));
        assert_eq!(patterns.len(), 2);
    }

    #[test]
    fn test_eq_and_in_forms() {
        let patterns = patterns_for_read(
            "messages",
            &doc! { "channel_id": { "$eq": "c-9" }, "user_id": { "$in": [1, 2] } },
        );
        assert!(patterns.contains("channel_id:c-9"));
        assert!(patterns.contains("user_id:1"));
        assert!(patterns.contains("user_id:2"));
    }

    #[test]
    fn test_numeric_tokens_collapse() {
        assert_eq!(scalar_token(&Bson::Int32(7)), Some("7".to_string()));
        assert_eq!(scalar_token(&Bson::Int64(7)), Some("7".to_string()));
        assert_eq!(scalar_token(&Bson::Double(7.0)), Some("7".to_string()));
    }

    #[test]
    fn test_targeted_write() {
        let patterns = patterns_for_write(
            "users",
            &doc! { "user_id": 7 },
            Some(&doc! { "$set": { "name": "x" } }),
        );
        assert_eq!(patterns.len(), 1);
        assert!(patterns.contains("user_id:7"));
    }

    #[test]
    fn test_write_setting_identity_field() {
        let patterns = patterns_for_write(
            "messages",
            &doc! { "message_id": 5 },
            Some(&doc! { "$set": { "channel_id": 9 } }),
        );
        assert!(patterns.contains("message_id:5"));
        assert!(patterns.contains("channel_id:9"));
    }

    #[test]
    fn test_broad_write_falls_back_to_collection() {
        let patterns = patterns_for_write("messages", &doc! { "flagged": true }, None);
        assert_eq!(patterns.len(), 1);
        assert!(patterns.contains("collection:messages"));
    }

    #[test]
    fn test_insert_patterns() {
        let patterns =
            patterns_for_insert("messages", &doc! { "user_id": 7, "content": "hi" });
        assert!(patterns.contains("user_id:7"));

        let anonymous = patterns_for_insert("events", &doc! { "kind": "tick" });
        assert!(anonymous.contains("collection:events"));
    }

    #[test]
    fn test_range_condition_is_not_identity() {
        assert!(!has_identity_equality(&doc! { "user_id": { "$gt": 5 } }));
        assert!(has_identity_equality(&doc! { "user_id": { "$eq": 5 } }));
        assert!(has_identity_equality(&doc! { "user_id": 5 }));
    }
}
