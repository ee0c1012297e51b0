//! Cache key derivation
//!
//! Keys are derived from a canonical rendering of the query shape: document
//! keys are recursively sorted so two filters assembled in different orders
//! produce the same key, while array element order is preserved because it is
//! semantically significant (`$in` lists, pipeline stages). The rendering is
//! hashed to a fixed-width key; shapes themselves are never stored.

use crate::types::QueryShape;
use bson::{Bson, Document};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Fixed-width cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(u64);

impl CacheKey {
    /// Derive the key for a query shape
    pub fn from_shape(shape: &QueryShape) -> Self {
        let fingerprint = canonical_fingerprint(shape);
        let mut hasher = DefaultHasher::new();
        fingerprint.hash(&mut hasher);
        CacheKey(hasher.finish())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Canonical rendering of a shape, stable across document construction order
pub fn canonical_fingerprint(shape: &QueryShape) -> String {
    let mut out = String::with_capacity(128);
    out.push_str(&shape.collection);
    out.push('|');
    out.push_str(shape.operation.as_str());
    out.push_str("|f=");
    write_document(&mut out, &shape.filter);
    out.push_str("|p=");
    write_optional(&mut out, shape.projection.as_ref());
    out.push_str("|s=");
    write_optional(&mut out, shape.sort.as_ref());
    match shape.limit {
        Some(l) => out.push_str(&format!("|l={}", l)),
        None => out.push_str("|l=_"),
    }
    match shape.skip {
        Some(k) => out.push_str(&format!("|k={}", k)),
        None => out.push_str("|k=_"),
    }
    out
}

fn write_optional(out: &mut String, doc: Option<&Document>) {
    match doc {
        Some(d) => write_document(out, d),
        None => out.push('_'),
    }
}

fn write_document(out: &mut String, doc: &Document) {
    let mut keys: Vec<&String> = doc.keys().collect();
    keys.sort();
    out.push('{');
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(key);
        out.push(':');
        write_value(out, doc.get(key.as_str()).unwrap_or(&Bson::Null));
    }
    out.push('}');
}

fn write_value(out: &mut String, value: &Bson) {
    match value {
        Bson::Document(d) => write_document(out, d),
        Bson::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Bson::String(s) => {
            out.push('"');
            out.push_str(s);
            out.push('"');
        }
        Bson::Int32(n) => out.push_str(&format!("i{}", n)),
        Bson::Int64(n) => out.push_str(&format!("l{}", n)),
        Bson::Double(n) => out.push_str(&format!("d{}", n)),
        Bson::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        Bson::Null => out.push_str("null"),
        Bson::ObjectId(oid) => out.push_str(&format!("o{}", oid)),
        Bson::DateTime(dt) => out.push_str(&format!("t{}", dt.timestamp_millis())),
        other => out.push_str(&format!("{:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FindOptions, QueryShape};
    use bson::doc;

    #[test]
    fn test_field_order_does_not_affect_key() {
        let a = QueryShape::find_one("users", doc! { "user_id": 7, "active": true });
        let b = QueryShape::find_one("users", doc! { "active": true, "user_id": 7 });
        assert_eq!(CacheKey::from_shape(&a), CacheKey::from_shape(&b));
    }

    #[test]
    fn test_nested_field_order_does_not_affect_key() {
        let a = QueryShape::find_one(
            "users",
            doc! { "meta": { "region": "eu", "tier": 2 } },
        );
        let b = QueryShape::find_one(
            "users",
            doc! { "meta": { "tier": 2, "region": "eu" } },
        );
        assert_eq!(CacheKey::from_shape(&a), CacheKey::from_shape(&b));
    }

    #[test]
    fn test_array_order_is_significant() {
        let a = QueryShape::find_one("users", doc! { "user_id": { "$in": [1, 2] } });
        let b = QueryShape::find_one("users", doc! { "user_id": { "$in": [2, 1] } });
        assert_ne!(CacheKey::from_shape(&a), CacheKey::from_shape(&b));
    }

    #[test]
    fn test_different_collections_differ() {
        let a = QueryShape::find_one("users", doc! { "user_id": 7 });
        let b = QueryShape::find_one("members", doc! { "user_id": 7 });
        assert_ne!(CacheKey::from_shape(&a), CacheKey::from_shape(&b));
    }

    #[test]
    fn test_options_participate_in_key() {
        let filter = doc! { "channel_id": 3 };
        let plain = QueryShape::find("messages", filter.clone(), &FindOptions::new());
        let limited = QueryShape::find(
            "messages",
            filter,
            &FindOptions::new().limit(10).sort(doc! { "timestamp": -1 }),
        );
        assert_ne!(CacheKey::from_shape(&plain), CacheKey::from_shape(&limited));
    }

    #[test]
    fn test_numeric_types_are_distinct() {
        let a = QueryShape::find_one("users", doc! { "user_id": 7_i32 });
        let b = QueryShape::find_one("users", doc! { "user_id": 7_i64 });
        assert_ne!(CacheKey::from_shape(&a), CacheKey::from_shape(&b));
    }

    #[test]
    fn test_fingerprint_is_readable() {
        let shape = QueryShape::find_one("users", doc! { "user_id": 7 });
        let fp = canonical_fingerprint(&shape);
        assert!(fp.starts_with("users|find_one|"));
        assert!(fp.contains("user_id:i7"));
    }
}
