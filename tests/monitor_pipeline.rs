//! Monitor Pipeline Integration Tests
//!
//! Feeds crafted operation samples through the public monitor surface and
//! checks what comes out the other end: signatures, reports,
//! recommendations, and trend alerts.
//!
//! # Test Coverage
//!
//! 1. **Signature Collapse** - Parameter variants group under one pattern
//! 2. **Recommendations** - Missing-index and cache-TTL rules fire on the
//!    documented thresholds, with priority ordering
//! 3. **Trend Detection** - Latency regressions alert; stable load does not
//! 4. **Suggestions** - Slow captures carry their diagnostic strings
//! 5. **Serialization** - Reports render to JSON for operational tooling

use bson::doc;
use remora::monitor::{
    MonitorConfig, OperationSample, PerformanceMonitor, Priority, RecommendationKind,
};
use remora::types::ExplainReport;
use std::time::Duration;

// =============================================================================
// Test Helpers
// =============================================================================

fn scan_report(collection: &str, examined: u64, returned: u64) -> ExplainReport {
    ExplainReport {
        collection: collection.to_string(),
        index_used: None,
        execution_time_ms: 20,
        docs_examined: examined,
        docs_returned: returned,
    }
}

fn channel_window_sample(channel_id: i32) -> OperationSample {
    OperationSample::new(
        "messages",
        "find",
        doc! {
            "channel_id": channel_id,
            "timestamp": { "$gte": 1_000 + channel_id as i64, "$lt": 2_000 },
        },
    )
    .with_duration(Duration::from_millis(5))
    .with_result_count(20)
}

// =============================================================================
// Test: Signature Collapse
// =============================================================================

/// Queries differing only in literals share one pattern in the report
#[test]
fn test_signature_collapse_groups_variants() {
    let monitor = PerformanceMonitor::new(MonitorConfig::default());
    for channel in [1, 2, 3] {
        monitor.record(channel_window_sample(channel));
    }
    monitor.record(
        OperationSample::new("users", "find_one", doc! { "user_id": 1 })
            .with_duration(Duration::from_millis(2))
            .with_result_count(1),
    );

    let report = monitor.report();
    assert_eq!(report.total_operations, 4);
    assert_eq!(report.top_patterns.len(), 2);
    assert_eq!(report.top_patterns[0].uses, 3);
    assert_eq!(
        report.top_patterns[0].signature,
        "messages.find{channel_id,timestamp.$gte,timestamp.$lt}"
    );
    assert_eq!(report.top_patterns[1].uses, 1);
}

// =============================================================================
// Test: Recommendations
// =============================================================================

/// Three slow executions of an unindexed shape produce a high-priority
/// missing-index recommendation; two do not
#[test]
fn test_missing_index_fires_on_third_repeat() {
    let monitor = PerformanceMonitor::new(MonitorConfig::default());
    let slow_scan = || {
        OperationSample::new("messages", "find", doc! { "content": "hello" })
            .with_duration(Duration::from_millis(150))
            .with_result_count(10)
            .with_explain(scan_report("messages", 5_000, 10))
    };

    monitor.record(slow_scan());
    monitor.record(slow_scan());
    assert!(monitor.recommendations().is_empty());

    monitor.record(slow_scan());
    let recs = monitor.recommendations();
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].priority, Priority::High);
    assert_eq!(recs[0].kind, RecommendationKind::MissingIndex);
    assert_eq!(recs[0].target, "messages.find{content}");
    assert!(recs[0].detail.contains("3 slow executions"));
}

/// A hot signature the cache keeps missing earns a TTL recommendation
#[test]
fn test_low_hit_rate_suggests_longer_ttl() {
    let monitor = PerformanceMonitor::new(MonitorConfig::default());
    for i in 0..12 {
        let mut sample = OperationSample::new("users", "find_one", doc! { "user_id": 1 })
            .with_duration(Duration::from_millis(1))
            .with_result_count(1);
        if i < 2 {
            sample = sample.from_cache();
        }
        monitor.record(sample);
    }

    let recs = monitor.recommendations();
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].priority, Priority::Low);
    assert_eq!(recs[0].kind, RecommendationKind::IncreaseCacheTtl);
    assert_eq!(recs[0].target, "users.find_one{user_id}");
    assert!(recs[0].detail.contains("17% cache hit rate"));
}

/// Recommendations come back ordered by priority
#[test]
fn test_recommendations_sorted_by_priority() {
    let monitor = PerformanceMonitor::new(MonitorConfig::default());
    // low: hot signature with poor hit rate
    for _ in 0..12 {
        monitor.record(
            OperationSample::new("users", "find_one", doc! { "user_id": 2 })
                .with_duration(Duration::from_millis(1)),
        );
    }
    // high: repeated slow scans of another shape
    for _ in 0..3 {
        monitor.record(
            OperationSample::new("messages", "find", doc! { "content": "x" })
                .with_duration(Duration::from_millis(200))
                .with_explain(scan_report("messages", 10_000, 5)),
        );
    }

    let recs = monitor.recommendations();
    assert_eq!(recs.len(), 2);
    assert_eq!(recs[0].priority, Priority::High);
    assert_eq!(recs[1].priority, Priority::Low);
}

// =============================================================================
// Test: Trend Detection
// =============================================================================

/// An 8x latency jump between adjacent windows raises an alert
#[test]
fn test_trend_alert_on_regression() {
    let monitor = PerformanceMonitor::new(MonitorConfig::default().with_trend_sample(3));
    for _ in 0..3 {
        monitor.record(
            OperationSample::new("messages", "find", doc! { "channel_id": 1 })
                .with_duration(Duration::from_millis(10)),
        );
    }
    for _ in 0..3 {
        monitor.record(
            OperationSample::new("messages", "find", doc! { "channel_id": 1 })
                .with_duration(Duration::from_millis(80)),
        );
    }

    let alert = monitor.check_trends().expect("regression not detected");
    assert!((alert.factor - 8.0).abs() < 1e-9);
    assert!((alert.recent_avg_ms - 80.0).abs() < 1e-9);
    assert!((alert.baseline_avg_ms - 10.0).abs() < 1e-9);
    assert_eq!(monitor.report().trend_alerts.len(), 1);
}

/// Stable latency never alerts
#[test]
fn test_no_trend_alert_under_stable_load() {
    let monitor = PerformanceMonitor::new(MonitorConfig::default().with_trend_sample(3));
    for _ in 0..6 {
        monitor.record(
            OperationSample::new("messages", "find", doc! { "channel_id": 1 })
                .with_duration(Duration::from_millis(10)),
        );
    }
    assert!(monitor.check_trends().is_none());
    assert!(monitor.report().trend_alerts.is_empty());
}

// =============================================================================
// Test: Suggestions
// =============================================================================

/// A slow unindexed scan is captured with every applicable diagnostic
#[test]
fn test_slow_capture_carries_diagnostics() {
    let monitor = PerformanceMonitor::new(MonitorConfig::default());
    monitor.record(
        OperationSample::new("messages", "find", doc! { "content": "hello" })
            .with_duration(Duration::from_millis(250))
            .with_result_count(3)
            .with_explain(scan_report("messages", 5_000, 3)),
    );

    let report = monitor.report();
    assert_eq!(report.slow_queries.len(), 1);
    let captured = &report.slow_queries[0];
    assert_eq!(captured.indexed, Some(false));
    let has = |needle: &str| captured.suggestions.iter().any(|s| s.contains(needle));
    assert!(has("slow threshold"));
    assert!(has("collection scan on messages"));
    assert!(has("low index efficiency"));
    assert!(has("no identity field"));
}

// =============================================================================
// Test: Serialization
// =============================================================================

/// The report renders to JSON with its headline figures intact
#[test]
fn test_report_serializes_to_json() {
    let monitor = PerformanceMonitor::new(MonitorConfig::default());
    monitor.record(channel_window_sample(1));
    monitor.record(channel_window_sample(2).from_cache());

    let report = monitor.report();
    let value = serde_json::to_value(&report).expect("report failed to serialize");
    assert_eq!(value["total_operations"], 2);
    assert!((value["cache_hit_rate"].as_f64().unwrap() - 0.5).abs() < 1e-9);
    assert!(value["top_patterns"].is_array());
    assert!(value["collections"].is_array());
    assert!(value["generated_at"].is_string());
}
