//! Query rewriting and hint selection
//!
//! `QueryOptimizer::optimize` takes the caller's filter/projection/sort and
//! returns the shape actually sent to the store, plus a trail of every
//! rewrite applied. The caller's sort is never reordered or mutated; the
//! optimizer only attaches hints and notes alignment with known indexes.

use crate::cache::patterns::has_identity_equality;
use crate::optimizer::rules;
use crate::types::{FindOptions, IndexHint, ReadOperation};
use bson::{doc, Bson, Document};
use serde::Serialize;
use std::time::Duration;

// ============================================================================
// Configuration
// ============================================================================

/// Optimizer configuration; each rewrite family has its own toggle
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Attach index hints from the rule table
    pub enable_hints: bool,
    /// Suggest minimal projections when the caller supplied none
    pub enable_projection_suggestions: bool,
    /// Coerce string-typed numeric identity values
    pub enable_numeric_coercion: bool,
    /// Rewrite free-text equality into case-insensitive prefix regex
    pub enable_text_prefix_rewrite: bool,
    /// Add a recency window to unbounded time-series queries
    pub enable_implicit_time_window: bool,
    /// Width of the implicit recency window
    pub implicit_window: Duration,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enable_hints: true,
            enable_projection_suggestions: true,
            enable_numeric_coercion: true,
            enable_text_prefix_rewrite: true,
            enable_implicit_time_window: true,
            implicit_window: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

impl OptimizerConfig {
    /// Set the implicit window width
    pub fn with_implicit_window(mut self, window: Duration) -> Self {
        self.implicit_window = window;
        self
    }

    /// Turn every rewrite family off (hints and suggestions included)
    pub fn passthrough() -> Self {
        Self {
            enable_hints: false,
            enable_projection_suggestions: false,
            enable_numeric_coercion: false,
            enable_text_prefix_rewrite: false,
            enable_implicit_time_window: false,
            ..Self::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.enable_implicit_time_window && self.implicit_window < Duration::from_secs(1) {
            return Err("optimizer implicit_window must be at least 1 second".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Results
// ============================================================================

/// One rewrite the optimizer applied, recorded for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AppliedOptimization {
    /// A string-typed identity value was coerced to its numeric form
    NumericCoercion {
        /// Field that was coerced
        field: String,
    },
    /// Free-text equality became an escaped case-insensitive prefix regex
    TextPrefixRewrite {
        /// Field that was rewritten
        field: String,
    },
    /// An unbounded time-series query received a recency lower bound
    ImplicitTimeWindow {
        /// Timestamp field the bound was added on
        field: String,
    },
    /// A hint rule matched the filter shape
    IndexHint {
        /// Index the query was steered to
        index: String,
    },
    /// The caller's sort aligns with a known compound index
    SortAlignedIndex {
        /// Index the sort aligns with
        index: String,
    },
    /// A minimal projection was suggested
    ProjectionSuggested {
        /// Number of fields in the suggestion
        fields: usize,
    },
}

/// The shape actually sent to the store
#[derive(Debug, Clone)]
pub struct OptimizedQuery {
    /// Rewritten filter
    pub filter: Document,
    /// Caller's projection, or the suggested one
    pub projection: Option<Document>,
    /// Caller's sort, untouched
    pub sort: Option<Document>,
    /// Hint to pass to the store
    pub hint: Option<IndexHint>,
    /// Every rewrite applied, in order
    pub applied: Vec<AppliedOptimization>,
}

// ============================================================================
// Optimizer
// ============================================================================

/// Rule-driven query optimizer
#[derive(Debug, Clone, Default)]
pub struct QueryOptimizer {
    config: OptimizerConfig,
}

impl QueryOptimizer {
    /// Optimizer with the given configuration
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Rewrite a query and pick its hint
    pub fn optimize(
        &self,
        collection: &str,
        operation: ReadOperation,
        mut filter: Document,
        options: &FindOptions,
    ) -> OptimizedQuery {
        let mut applied = Vec::new();

        if self.config.enable_numeric_coercion {
            coerce_numeric_ids(&mut filter, &mut applied);
        }
        if self.config.enable_text_prefix_rewrite {
            rewrite_text_equality(&mut filter, &mut applied);
        }
        if self.config.enable_implicit_time_window {
            self.apply_time_window(collection, &mut filter, &mut applied);
        }

        let mut hint = options.hint.clone();
        if hint.is_none() && self.config.enable_hints {
            hint = match_hint(collection, &filter, options.sort.as_ref(), &mut applied);
        }

        let projection = match &options.projection {
            Some(p) => Some(p.clone()),
            None if self.config.enable_projection_suggestions => {
                suggest_projection(collection, operation, &mut applied)
            }
            None => None,
        };

        OptimizedQuery {
            filter,
            projection,
            sort: options.sort.clone(),
            hint,
            applied,
        }
    }

    fn apply_time_window(
        &self,
        collection: &str,
        filter: &mut Document,
        applied: &mut Vec<AppliedOptimization>,
    ) {
        let ts_field = match rules::time_series_field(collection) {
            Some(f) => f,
            None => return,
        };
        if filter.contains_key(ts_field) || has_identity_equality(filter) {
            return;
        }
        let cutoff = bson::DateTime::from_millis(
            bson::DateTime::now().timestamp_millis() - self.config.implicit_window.as_millis() as i64,
        );
        filter.insert(ts_field, doc! { "$gte": cutoff });
        applied.push(AppliedOptimization::ImplicitTimeWindow {
            field: ts_field.to_string(),
        });
    }
}

fn parse_numeric(s: &str) -> Option<Bson> {
    s.parse::<i64>().ok().map(Bson::Int64)
}

fn coerce_numeric_ids(filter: &mut Document, applied: &mut Vec<AppliedOptimization>) {
    for field in rules::NUMERIC_ID_FIELDS {
        let value = match filter.get_mut(*field) {
            Some(v) => v,
            None => continue,
        };
        let mut coerced = false;
        let direct = match value {
            Bson::String(s) => parse_numeric(s),
            _ => None,
        };
        if let Some(numeric) = direct {
            *value = numeric;
            coerced = true;
        } else if let Bson::Document(ops) = value {
            if let Some(eq) = ops.get_mut("$eq") {
                let replacement = match eq {
                    Bson::String(s) => parse_numeric(s),
                    _ => None,
                };
                if let Some(numeric) = replacement {
                    *eq = numeric;
                    coerced = true;
                }
            }
            if let Some(Bson::Array(items)) = ops.get_mut("$in") {
                for item in items.iter_mut() {
                    let replacement = match item {
                        Bson::String(s) => parse_numeric(s),
                        _ => None,
                    };
                    if let Some(numeric) = replacement {
                        *item = numeric;
                        coerced = true;
                    }
                }
            }
        }
        if coerced {
            applied.push(AppliedOptimization::NumericCoercion {
                field: field.to_string(),
            });
        }
    }
}

fn rewrite_text_equality(filter: &mut Document, applied: &mut Vec<AppliedOptimization>) {
    for field in crate::cache::patterns::FREE_TEXT_FIELDS {
        let value = match filter.get_mut(*field) {
            Some(v) => v,
            None => continue,
        };
        let pattern = match value {
            Bson::String(s) => format!("^{}", regex::escape(s)),
            _ => continue,
        };
        *value = Bson::Document(doc! { "$regex": pattern, "$options": "i" });
        applied.push(AppliedOptimization::TextPrefixRewrite {
            field: field.to_string(),
        });
    }
}

fn match_hint(
    collection: &str,
    filter: &Document,
    sort: Option<&Document>,
    applied: &mut Vec<AppliedOptimization>,
) -> Option<IndexHint> {
    for rule in rules::HINT_RULES.iter() {
        if rule.collection != collection {
            continue;
        }
        if !rule.filter_fields.iter().all(|f| filter.contains_key(*f)) {
            continue;
        }
        if let Some(required) = rule.sort_prefix {
            let leading = sort.and_then(|s| s.keys().next());
            if leading.map(|k| k.as_str()) != Some(required) {
                continue;
            }
        }
        applied.push(AppliedOptimization::IndexHint {
            index: rule.index.to_string(),
        });
        return Some(IndexHint::Name(rule.index.to_string()));
    }

    // No field rule matched; a sort aligned with a known compound index
    // still earns the hint
    if let Some(sort) = sort {
        for (coll, name, keys) in rules::COMPOUND_INDEXES {
            if *coll == collection && sort_matches_prefix(sort, keys) {
                applied.push(AppliedOptimization::SortAlignedIndex {
                    index: name.to_string(),
                });
                return Some(IndexHint::Name(name.to_string()));
            }
        }
    }
    None
}

/// Whether `sort` is a prefix of the index keys with uniform direction
/// (all the same as the index, or all inverted)
fn sort_matches_prefix(sort: &Document, keys: &[(&str, i32)]) -> bool {
    if sort.is_empty() || sort.len() > keys.len() {
        return false;
    }
    let mut flip: Option<i32> = None;
    for ((sort_field, sort_dir), (index_field, index_dir)) in sort.iter().zip(keys.iter()) {
        if sort_field.as_str() != *index_field {
            return false;
        }
        let dir = match sort_dir {
            Bson::Int32(n) => *n,
            Bson::Int64(n) => *n as i32,
            Bson::Double(n) => *n as i32,
            _ => return false,
        };
        if dir != 1 && dir != -1 {
            return false;
        }
        let this_flip = dir * index_dir;
        match flip {
            None => flip = Some(this_flip),
            Some(f) if f != this_flip => return false,
            Some(_) => {}
        }
    }
    true
}

fn suggest_projection(
    collection: &str,
    operation: ReadOperation,
    applied: &mut Vec<AppliedOptimization>,
) -> Option<Document> {
    let rule = rules::PROJECTION_RULES
        .iter()
        .find(|r| r.collection == collection && r.operation == operation)?;
    let mut projection = Document::new();
    for field in rule.fields {
        projection.insert(*field, 1_i32);
    }
    applied.push(AppliedOptimization::ProjectionSuggested {
        fields: rule.fields.len(),
    });
    Some(projection)
}
