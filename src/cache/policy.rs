//! Cache classification policy
//!
//! Every cached shape is assigned one of six classes, each carrying a static
//! TTL and an eviction priority. Classification is an ordered rule table over
//! the collection name, the operation, and the filter's field names; the
//! first matching rule wins. Per-class TTLs can be overridden from
//! configuration without touching the table.

use crate::cache::patterns::{has_identity_equality, FREE_TEXT_FIELDS};
use crate::types::{QueryShape, ReadOperation};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Behavioral class of a cached entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheClass {
    /// Identity lookups (single entity by id)
    Identity,
    /// Time-ordered reads (messages, logs, events)
    History,
    /// Text and pattern lookups
    Search,
    /// Counts and aggregations
    Stats,
    /// Volatile liveness data
    Presence,
    /// Rarely-changing settings
    Config,
}

impl CacheClass {
    /// Default time-to-live for the class
    pub fn default_ttl(&self) -> Duration {
        match self {
            CacheClass::Presence => Duration::from_secs(2 * 60),
            CacheClass::Search => Duration::from_secs(5 * 60),
            CacheClass::History => Duration::from_secs(10 * 60),
            CacheClass::Stats => Duration::from_secs(15 * 60),
            CacheClass::Identity => Duration::from_secs(30 * 60),
            CacheClass::Config => Duration::from_secs(60 * 60),
        }
    }

    /// Eviction priority; higher survives longer under pressure
    pub fn priority(&self) -> u8 {
        match self {
            CacheClass::Presence => 1,
            CacheClass::Search => 2,
            CacheClass::Stats => 2,
            CacheClass::History => 3,
            CacheClass::Config => 4,
            CacheClass::Identity => 5,
        }
    }

    /// Stable name used in stats and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheClass::Identity => "identity",
            CacheClass::History => "history",
            CacheClass::Search => "search",
            CacheClass::Stats => "stats",
            CacheClass::Presence => "presence",
            CacheClass::Config => "config",
        }
    }
}

struct ClassRule {
    class: CacheClass,
    applies: fn(&QueryShape) -> bool,
}

fn collection_contains(shape: &QueryShape, needles: &[&str]) -> bool {
    let name = shape.collection.to_ascii_lowercase();
    needles.iter().any(|n| name.contains(n))
}

/// Ordered classification rules; first match wins
static CLASS_RULES: Lazy<Vec<ClassRule>> = Lazy::new(|| {
    vec![
        ClassRule {
            class: CacheClass::Config,
            applies: |s| collection_contains(s, &["config", "settings"]),
        },
        ClassRule {
            class: CacheClass::Presence,
            applies: |s| collection_contains(s, &["presence", "status", "session"]),
        },
        ClassRule {
            class: CacheClass::Stats,
            applies: |s| collection_contains(s, &["stats", "metrics", "analytics", "counter"]),
        },
        ClassRule {
            class: CacheClass::Search,
            applies: |s| {
                s.filter.iter().any(|(field, value)| {
                    let regex = matches!(value, bson::Bson::Document(d) if d.contains_key("$regex"));
                    regex || FREE_TEXT_FIELDS.contains(&field.as_str())
                })
            },
        },
        ClassRule {
            class: CacheClass::Identity,
            applies: |s| s.operation == ReadOperation::FindOne && has_identity_equality(&s.filter),
        },
        ClassRule {
            class: CacheClass::History,
            applies: |s| {
                collection_contains(s, &["message", "history", "log", "audit", "event"])
                    || s.sort
                        .as_ref()
                        .map(|sort| {
                            sort.keys()
                                .next()
                                .map(|k| k.contains("timestamp") || k.contains("created"))
                                .unwrap_or(false)
                        })
                        .unwrap_or(false)
            },
        },
    ]
});

/// Classification policy with configurable TTL overrides
#[derive(Debug, Clone, Default)]
pub struct CachePolicy {
    overrides: HashMap<CacheClass, Duration>,
}

impl CachePolicy {
    /// Policy with the default TTL table
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy with per-class TTL overrides applied
    pub fn with_overrides(overrides: HashMap<CacheClass, Duration>) -> Self {
        Self { overrides }
    }

    /// Classify a shape via the ordered rule table
    pub fn classify(&self, shape: &QueryShape) -> CacheClass {
        for rule in CLASS_RULES.iter() {
            if (rule.applies)(shape) {
                return rule.class;
            }
        }
        // Unmatched counts and aggregations behave like stats; everything
        // else defaults to the history profile
        match shape.operation {
            ReadOperation::Count | ReadOperation::Aggregate => CacheClass::Stats,
            _ => CacheClass::History,
        }
    }

    /// Effective TTL for a class, honoring overrides
    pub fn ttl_for(&self, class: CacheClass) -> Duration {
        self.overrides
            .get(&class)
            .copied()
            .unwrap_or_else(|| class.default_ttl())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FindOptions;
    use bson::doc;

    fn policy() -> CachePolicy {
        CachePolicy::new()
    }

    #[test]
    fn test_identity_lookup() {
        let shape = QueryShape::find_one("users", doc! { "user_id": 7 });
        assert_eq!(policy().classify(&shape), CacheClass::Identity);
    }

    #[test]
    fn test_collection_patterns() {
        let p = policy();
        assert_eq!(
            p.classify(&QueryShape::find_one("guild_config", doc! { "guild_id": 1 })),
            CacheClass::Config
        );
        assert_eq!(
            p.classify(&QueryShape::find_one("presence", doc! { "user_id": 1 })),
            CacheClass::Presence
        );
        assert_eq!(
            p.classify(&QueryShape::count("channel_stats", doc! {})),
            CacheClass::Stats
        );
    }

    #[test]
    fn test_search_by_regex_or_text_field() {
        let p = policy();
        let regex = QueryShape::find(
            "users",
            doc! { "bio": { "$regex": "^ab" } },
            &FindOptions::new(),
        );
        assert_eq!(p.classify(&regex), CacheClass::Search);

        let text = QueryShape::find_one("users", doc! { "username": "marin" });
        assert_eq!(p.classify(&text), CacheClass::Search);
    }

    #[test]
    fn test_history_by_collection_or_sort() {
        let p = policy();
        let by_name = QueryShape::find("messages", doc! { "channel_id": 3 }, &FindOptions::new());
        assert_eq!(p.classify(&by_name), CacheClass::History);

        let by_sort = QueryShape::find(
            "uploads",
            doc! { "owner_id": 3 },
            &FindOptions::new().sort(doc! { "created_at": -1 }),
        );
        assert_eq!(p.classify(&by_sort), CacheClass::History);
    }

    #[test]
    fn test_fallbacks() {
        let p = policy();
        let count = QueryShape::count("widgets", doc! { "size": 3 });
        assert_eq!(p.classify(&count), CacheClass::Stats);

        let find = QueryShape::find("widgets", doc! { "size": 3 }, &FindOptions::new());
        assert_eq!(p.classify(&find), CacheClass::History);
    }

    #[test]
    fn test_rule_order_config_beats_identity() {
        let shape = QueryShape::find_one("guild_settings", doc! { "guild_id": 9 });
        assert_eq!(policy().classify(&shape), CacheClass::Config);
    }

    #[test]
    fn test_ttl_override() {
        let mut overrides = HashMap::new();
        overrides.insert(CacheClass::Identity, Duration::from_millis(50));
        let p = CachePolicy::with_overrides(overrides);
        assert_eq!(p.ttl_for(CacheClass::Identity), Duration::from_millis(50));
        assert_eq!(p.ttl_for(CacheClass::Presence), Duration::from_secs(120));
    }

    #[test]
    fn test_ttl_range() {
        assert_eq!(CacheClass::Presence.default_ttl(), Duration::from_secs(120));
        assert_eq!(CacheClass::Config.default_ttl(), Duration::from_secs(3600));
        assert!(CacheClass::Identity.priority() > CacheClass::Presence.priority());
    }
}
