//! Recommendation derivation
//!
//! Turns the recorder's tallies into actionable items: repeated slow
//! queries with no index backing, collections with poor index utilization,
//! and hot signatures the cache keeps missing. Output is sorted by
//! priority and deduplicated per target.

use crate::monitor::recorder::{CollectionTally, RecordedOperation, SignatureTally};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};

/// Slow-buffer repeats before a missing-index recommendation fires
const MIN_SLOW_REPEATS: usize = 3;
/// Explained operations before index utilization is judged
const MIN_COLLECTION_ACCESSES: u64 = 100;
/// Index-backed share below which utilization counts as low
const LOW_INDEX_RATIO: f64 = 0.5;
/// Signature uses before cache hit rate is judged
const MIN_SIGNATURE_USES: u64 = 10;
/// Hit rate below which a TTL increase is suggested
const LOW_HIT_RATE: f64 = 0.3;

/// Recommendation urgency, `High` sorts first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Tuning opportunity
    Low,
    /// Worth scheduling
    Medium,
    /// Actively hurting latency
    High,
}

/// What kind of change is being proposed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    /// Create an index for a repeatedly slow query shape
    MissingIndex,
    /// Most queries against the collection bypass indexes
    LowIndexUtilization,
    /// Raise the cache TTL for a hot signature
    IncreaseCacheTtl,
}

/// One proposed change, addressed to a signature or collection
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    /// Urgency
    pub priority: Priority,
    /// Proposed change
    pub kind: RecommendationKind,
    /// Signature or collection the change applies to
    pub target: String,
    /// Human-readable evidence
    pub detail: String,
}

/// Derive recommendations from the recorder's state
pub(crate) fn generate(
    slow: &VecDeque<RecordedOperation>,
    per_collection: &HashMap<String, CollectionTally>,
    per_signature: &HashMap<String, SignatureTally>,
) -> Vec<Recommendation> {
    let mut out = Vec::new();

    // repeated slow executions with no evidence of an index
    let mut unindexed_slow: HashMap<&str, usize> = HashMap::new();
    for entry in slow {
        if entry.indexed != Some(true) {
            *unindexed_slow.entry(entry.signature.as_str()).or_insert(0) += 1;
        }
    }
    for (signature, count) in unindexed_slow {
        if count >= MIN_SLOW_REPEATS {
            out.push(Recommendation {
                priority: Priority::High,
                kind: RecommendationKind::MissingIndex,
                target: signature.to_string(),
                detail: format!("{} slow executions without index backing", count),
            });
        }
    }

    // collections where explained queries mostly scan
    for (collection, tally) in per_collection {
        let explained = tally.indexed + tally.scans;
        if explained > MIN_COLLECTION_ACCESSES
            && (tally.indexed as f64) < explained as f64 * LOW_INDEX_RATIO
        {
            out.push(Recommendation {
                priority: Priority::Medium,
                kind: RecommendationKind::LowIndexUtilization,
                target: collection.clone(),
                detail: format!(
                    "{} of {} explained queries used an index",
                    tally.indexed, explained
                ),
            });
        }
    }

    // hot signatures the cache keeps missing
    for (signature, tally) in per_signature {
        if tally.uses < MIN_SIGNATURE_USES {
            continue;
        }
        let hit_rate = tally.cache_hits as f64 / tally.uses as f64;
        if hit_rate < LOW_HIT_RATE {
            out.push(Recommendation {
                priority: Priority::Low,
                kind: RecommendationKind::IncreaseCacheTtl,
                target: signature.clone(),
                detail: format!(
                    "{} uses with {:.0}% cache hit rate",
                    tally.uses,
                    hit_rate * 100.0
                ),
            });
        }
    }

    out.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.target.cmp(&b.target)));
    let mut seen = HashSet::new();
    out.retain(|r| seen.insert(r.target.clone()));
    out
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn slow_entry(signature: &str, indexed: Option<bool>) -> RecordedOperation {
        RecordedOperation {
            signature: signature.to_string(),
            collection: "messages".to_string(),
            operation: "find".to_string(),
            duration_ms: 180.0,
            result_count: 10,
            cache_hit: false,
            indexed,
            suggestions: Vec::new(),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_missing_index_needs_three_repeats() {
        let mut slow = VecDeque::new();
        slow.push_back(slow_entry("messages.find{flavor}", None));
        slow.push_back(slow_entry("messages.find{flavor}", Some(false)));
        let recs = generate(&slow, &HashMap::new(), &HashMap::new());
        assert!(recs.is_empty());

        slow.push_back(slow_entry("messages.find{flavor}", None));
        let recs = generate(&slow, &HashMap::new(), &HashMap::new());
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].priority, Priority::High);
        assert_eq!(recs[0].kind, RecommendationKind::MissingIndex);
        assert_eq!(recs[0].target, "messages.find{flavor}");
    }

    #[test]
    fn test_indexed_slow_queries_excluded() {
        let mut slow = VecDeque::new();
        for _ in 0..5 {
            slow.push_back(slow_entry("messages.find{channel_id}", Some(true)));
        }
        let recs = generate(&slow, &HashMap::new(), &HashMap::new());
        assert!(recs.is_empty());
    }

    #[test]
    fn test_low_index_utilization() {
        let mut collections = HashMap::new();
        collections.insert(
            "messages".to_string(),
            CollectionTally {
                accesses: 150,
                cache_hits: 0,
                indexed: 40,
                scans: 80,
                total_ms: 500.0,
            },
        );
        let recs = generate(&VecDeque::new(), &collections, &HashMap::new());
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].priority, Priority::Medium);
        assert_eq!(recs[0].kind, RecommendationKind::LowIndexUtilization);
        assert_eq!(recs[0].target, "messages");
    }

    #[test]
    fn test_well_indexed_collection_passes() {
        let mut collections = HashMap::new();
        collections.insert(
            "messages".to_string(),
            CollectionTally {
                accesses: 150,
                cache_hits: 0,
                indexed: 110,
                scans: 10,
                total_ms: 500.0,
            },
        );
        let recs = generate(&VecDeque::new(), &collections, &HashMap::new());
        assert!(recs.is_empty());
    }

    #[test]
    fn test_low_hit_rate_signature() {
        let mut signatures = HashMap::new();
        signatures.insert(
            "users.find_one{user_id}".to_string(),
            SignatureTally {
                collection: "users".to_string(),
                uses: 12,
                cache_hits: 2,
                total_ms: 60.0,
            },
        );
        let recs = generate(&VecDeque::new(), &HashMap::new(), &signatures);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].priority, Priority::Low);
        assert_eq!(recs[0].kind, RecommendationKind::IncreaseCacheTtl);
    }

    #[test]
    fn test_sorted_by_priority_and_deduplicated() {
        let mut slow = VecDeque::new();
        for _ in 0..3 {
            slow.push_back(slow_entry("messages.find{flavor}", None));
        }
        let mut signatures = HashMap::new();
        // same target as the slow-query rule
        signatures.insert(
            "messages.find{flavor}".to_string(),
            SignatureTally {
                collection: "messages".to_string(),
                uses: 20,
                cache_hits: 0,
                total_ms: 900.0,
            },
        );
        signatures.insert(
            "users.find_one{user_id}".to_string(),
            SignatureTally {
                collection: "users".to_string(),
                uses: 15,
                cache_hits: 1,
                total_ms: 60.0,
            },
        );
        let recs = generate(&slow, &HashMap::new(), &signatures);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].priority, Priority::High);
        assert_eq!(recs[0].target, "messages.find{flavor}");
        assert_eq!(recs[1].priority, Priority::Low);
        assert_eq!(recs[1].target, "users.find_one{user_id}");
    }
}
