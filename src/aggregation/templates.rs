//! Aggregation pipeline templates
//!
//! Stateless builders, one per analytic shape. Each takes entity/window/limit
//! parameters and returns the stage list ready for execution; nothing here
//! touches the store. Stage documents are built in wire order, so compound
//! `$sort` keys and `$group` accumulators keep their intended precedence.

use bson::{doc, DateTime, Document};
use std::time::Duration;

fn window_start(window: Duration) -> DateTime {
    DateTime::from_millis(DateTime::now().timestamp_millis() - window.as_millis() as i64)
}

/// Per-entity activity bucketed by day, most recent day first
///
/// Groups on a `%Y-%m-%d` rendering of `ts_field`, counting matching
/// documents per bucket.
pub fn activity_by_day(
    entity_field: &str,
    entity_id: impl Into<bson::Bson>,
    ts_field: &str,
    window: Duration,
) -> Vec<Document> {
    vec![
        doc! { "$match": {
            entity_field: entity_id.into(),
            ts_field: { "$gte": window_start(window) },
        } },
        doc! { "$group": {
            "_id": { "$dateToString": { "format": "%Y-%m-%d", "date": format!("${}", ts_field) } },
            "count": { "$sum": 1 },
        } },
        doc! { "$sort": { "_id": -1 } },
    ]
}

/// Top-N entities by document count over a window
pub fn leaderboard(
    entity_field: &str,
    ts_field: &str,
    window: Duration,
    limit: i64,
) -> Vec<Document> {
    vec![
        doc! { "$match": { ts_field: { "$gte": window_start(window) } } },
        doc! { "$group": {
            "_id": format!("${}", entity_field),
            "count": { "$sum": 1 },
        } },
        doc! { "$sort": { "count": -1 } },
        doc! { "$limit": limit },
    ]
}

/// Hour-of-day histogram over a window, hours ascending
pub fn hourly_histogram(
    entity_field: &str,
    entity_id: impl Into<bson::Bson>,
    ts_field: &str,
    window: Duration,
) -> Vec<Document> {
    vec![
        doc! { "$match": {
            entity_field: entity_id.into(),
            ts_field: { "$gte": window_start(window) },
        } },
        doc! { "$group": {
            "_id": { "$hour": format!("${}", ts_field) },
            "count": { "$sum": 1 },
        } },
        doc! { "$sort": { "_id": 1 } },
    ]
}

/// Who references this entity most, descending
///
/// `ref_field` holds the referenced entity, `by_field` the referencing one.
pub fn top_referencers(
    ref_field: &str,
    entity_id: impl Into<bson::Bson>,
    by_field: &str,
    ts_field: &str,
    window: Duration,
    limit: i64,
) -> Vec<Document> {
    vec![
        doc! { "$match": {
            ref_field: entity_id.into(),
            ts_field: { "$gte": window_start(window) },
        } },
        doc! { "$group": {
            "_id": format!("${}", by_field),
            "count": { "$sum": 1 },
        } },
        doc! { "$sort": { "count": -1 } },
        doc! { "$limit": limit },
    ]
}

/// Burst detection: per (entity, hour) counts above a threshold, descending
pub fn anomaly_summary(
    entity_field: &str,
    ts_field: &str,
    window: Duration,
    min_count: i64,
) -> Vec<Document> {
    vec![
        doc! { "$match": { ts_field: { "$gte": window_start(window) } } },
        doc! { "$group": {
            "_id": {
                "entity": format!("${}", entity_field),
                "hour": { "$dateToString": { "format": "%Y-%m-%dT%H", "date": format!("${}", ts_field) } },
            },
            "count": { "$sum": 1 },
        } },
        doc! { "$match": { "count": { "$gte": min_count } } },
        doc! { "$sort": { "count": -1 } },
    ]
}

/// Per-bucket ranking with distinct-contributor counts
///
/// Groups on `bucket_field`, counting documents and distinct values of
/// `contributor_field` per bucket.
pub fn bucket_ranking(
    bucket_field: &str,
    contributor_field: &str,
    ts_field: &str,
    window: Duration,
    limit: i64,
) -> Vec<Document> {
    vec![
        doc! { "$match": { ts_field: { "$gte": window_start(window) } } },
        doc! { "$group": {
            "_id": format!("${}", bucket_field),
            "count": { "$sum": 1 },
            "contributors": { "$addToSet": format!("${}", contributor_field) },
        } },
        doc! { "$project": {
            "count": 1,
            "distinct_contributors": { "$size": "$contributors" },
        } },
        doc! { "$sort": { "count": -1 } },
        doc! { "$limit": limit },
    ]
}

/// Per-day creation counts ascending; feed the rows to [`cumulative`] for
/// running totals
pub fn growth_trend(ts_field: &str, window: Duration) -> Vec<Document> {
    vec![
        doc! { "$match": { ts_field: { "$gte": window_start(window) } } },
        doc! { "$group": {
            "_id": { "$dateToString": { "format": "%Y-%m-%d", "date": format!("${}", ts_field) } },
            "count": { "$sum": 1 },
        } },
        doc! { "$sort": { "_id": 1 } },
    ]
}

/// Fold per-day rows into running totals
///
/// Each output row carries the original `_id` and `count` plus a
/// `cumulative` field.
pub fn cumulative(rows: &[Document]) -> Vec<Document> {
    let mut total: i64 = 0;
    rows.iter()
        .map(|row| {
            let count = row
                .get_i64("count")
                .or_else(|_| row.get_i32("count").map(i64::from))
                .unwrap_or(0);
            total += count;
            let mut out = row.clone();
            out.insert("cumulative", total);
            out
        })
        .collect()
}
