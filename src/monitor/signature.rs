//! Query signature extraction
//!
//! A signature keeps the shape of a query (collection, operation, field
//! names, operator tokens) and discards every literal value, so
//! parameter-variants of the same query collapse into one bucket for
//! pattern analysis. Signatures are a diagnostic index only; cache keys
//! hash the full query instead.

use bson::{Bson, Document};

/// Lossy signature for an operation, e.g. `messages.find{channel_id,timestamp.$gte}`
pub fn query_signature(collection: &str, operation: &str, filter: &Document) -> String {
    let mut tokens = Vec::new();
    collect_tokens(filter, "", &mut tokens);
    tokens.sort();
    tokens.dedup();
    format!("{}.{}{{{}}}", collection, operation, tokens.join(","))
}

fn collect_tokens(doc: &Document, prefix: &str, out: &mut Vec<String>) {
    for (key, value) in doc {
        if key.starts_with('$') {
            // logical operator: flatten the clause list
            if let Bson::Array(clauses) = value {
                for clause in clauses {
                    if let Bson::Document(inner) = clause {
                        collect_tokens(inner, prefix, out);
                    }
                }
            }
            continue;
        }
        match value {
            Bson::Document(inner) if inner.keys().any(|k| k.starts_with('$')) => {
                for op in inner.keys() {
                    if op == "$options" {
                        continue;
                    }
                    out.push(format!("{}{}.{}", prefix, key, op));
                }
            }
            _ => out.push(format!("{}{}", prefix, key)),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
