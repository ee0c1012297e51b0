//! Optimizer rule tables
//!
//! All steering data lives here as ordered tables: which filter shapes map to
//! which index hints, which `(collection, operation)` pairs get a suggested
//! projection, which collections are time-series and on what field, and which
//! identity fields are numeric.
//!
//! Matching is rule-based over field *names*, never over values; the first
//! matching rule wins, so more specific rules come first.

use crate::types::ReadOperation;
use once_cell::sync::Lazy;

/// One hint rule: a filter field set (plus an optional leading sort field)
/// that maps onto a known index
pub struct HintRule {
    /// Target collection
    pub collection: &'static str,
    /// Fields that must all appear in the filter
    pub filter_fields: &'static [&'static str],
    /// Leading sort field that must match, when required
    pub sort_prefix: Option<&'static str>,
    /// Index name to hint
    pub index: &'static str,
}

/// Ordered hint rules; first match wins
pub static HINT_RULES: Lazy<Vec<HintRule>> = Lazy::new(|| {
    vec![
        HintRule {
            collection: "messages",
            filter_fields: &["guild_id", "channel_id"],
            sort_prefix: None,
            index: "guild_id_1_channel_id_1_timestamp_-1",
        },
        HintRule {
            collection: "messages",
            filter_fields: &["channel_id"],
            sort_prefix: Some("timestamp"),
            index: "channel_id_1_timestamp_-1",
        },
        HintRule {
            collection: "messages",
            filter_fields: &["user_id"],
            sort_prefix: Some("timestamp"),
            index: "user_id_1_timestamp_-1",
        },
        HintRule {
            collection: "messages",
            filter_fields: &["channel_id"],
            sort_prefix: None,
            index: "channel_id_1_timestamp_-1",
        },
        HintRule {
            collection: "users",
            filter_fields: &["user_id"],
            sort_prefix: None,
            index: "user_id_1",
        },
        HintRule {
            collection: "users",
            filter_fields: &["username"],
            sort_prefix: None,
            index: "username_1",
        },
        HintRule {
            collection: "presence",
            filter_fields: &["user_id"],
            sort_prefix: None,
            index: "user_id_1",
        },
    ]
});

/// Suggested minimal projection for one `(collection, operation)` pair
pub struct ProjectionRule {
    /// Target collection
    pub collection: &'static str,
    /// Operation the suggestion applies to
    pub operation: ReadOperation,
    /// Fields worth returning
    pub fields: &'static [&'static str],
}

/// Projection suggestions, consulted only when the caller supplied none
pub static PROJECTION_RULES: Lazy<Vec<ProjectionRule>> = Lazy::new(|| {
    vec![
        ProjectionRule {
            collection: "users",
            operation: ReadOperation::FindOne,
            fields: &["user_id", "username", "name", "avatar", "created_at"],
        },
        ProjectionRule {
            collection: "messages",
            operation: ReadOperation::Find,
            fields: &["message_id", "channel_id", "user_id", "content", "timestamp"],
        },
        ProjectionRule {
            collection: "presence",
            operation: ReadOperation::FindOne,
            fields: &["user_id", "status", "updated_at"],
        },
    ]
});

/// Time-series collections and their timestamp field
///
/// Queries against these with no bound on the timestamp field and no identity
/// equality receive an implicit recency window.
pub static TIME_SERIES_COLLECTIONS: &[(&str, &str)] = &[
    ("messages", "timestamp"),
    ("events", "timestamp"),
    ("audit_log", "created_at"),
];

/// Identity fields whose values are numeric ids; string literals on these
/// are coerced when they parse cleanly
pub static NUMERIC_ID_FIELDS: &[&str] =
    &["user_id", "owner_id", "channel_id", "message_id", "guild_id"];

/// Known compound indexes per collection, used to recognize index-aligned
/// sorts (same or fully inverted directions)
pub static COMPOUND_INDEXES: &[(&str, &str, &[(&str, i32)])] = &[
    (
        "messages",
        "channel_id_1_timestamp_-1",
        &[("channel_id", 1), ("timestamp", -1)],
    ),
    (
        "messages",
        "user_id_1_timestamp_-1",
        &[("user_id", 1), ("timestamp", -1)],
    ),
    (
        "messages",
        "guild_id_1_channel_id_1_timestamp_-1",
        &[("guild_id", 1), ("channel_id", 1), ("timestamp", -1)],
    ),
];

/// Timestamp field of a time-series collection, when it is one
pub fn time_series_field(collection: &str) -> Option<&'static str> {
    TIME_SERIES_COLLECTIONS
        .iter()
        .find(|(name, _)| *name == collection)
        .map(|(_, field)| *field)
}
