//! Explain probe
//!
//! Diagnostic wrapper around the store's explain command. The probe never
//! fails its caller: timeouts and store errors are logged at warn and
//! collapse to `None`.

use crate::store::traits::DocumentStore;
use crate::types::{ExplainReport, FindOptions};
use bson::Document;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Bound on how long a probe may hold the store
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Run an explain for a find, returning `None` on any failure
pub async fn probe(
    store: &Arc<dyn DocumentStore>,
    collection: &str,
    filter: Document,
    options: &FindOptions,
) -> Option<ExplainReport> {
    let request = store.explain_find(collection, filter, options);
    match tokio::time::timeout(PROBE_TIMEOUT, request).await {
        Ok(Ok(report)) => {
            debug!(
                collection,
                index = report.index_used.as_deref().unwrap_or("none"),
                examined = report.docs_examined,
                returned = report.docs_returned,
                "explain probe finished"
            );
            Some(report)
        }
        Ok(Err(e)) => {
            warn!(collection, error = %e, "explain probe failed");
            None
        }
        Err(_) => {
            warn!(collection, timeout_secs = PROBE_TIMEOUT.as_secs(), "explain probe timed out");
            None
        }
    }
}
