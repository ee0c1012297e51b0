//! Error types for the access layer

use thiserror::Error;

/// Main error type for the access layer
#[derive(Error, Debug)]
pub enum Error {
    /// The facade was used before `start()` completed
    #[error("access layer not started; call start() before issuing operations")]
    NotStarted,

    /// The shared store connection is marked inactive
    #[error("document store unavailable: {reason}")]
    StoreUnavailable {
        /// Why the connection is considered down
        reason: String,
    },

    /// Store error, propagated unmodified from the store client
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Batch pipeline error
    #[error("batch error: {0}")]
    Batch(#[from] BatchError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Errors surfaced by the store client
#[derive(Error, Debug)]
pub enum StoreError {
    /// The underlying connection dropped mid-operation
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// An operation exceeded its allotted time
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Bulk write failed with no operation applied
    ///
    /// Partial failures never take this path: they return an `Ok` summary
    /// carrying per-operation failures so applied counts stay attributable.
    #[error("bulk write failed before any operation applied: {reason}")]
    BulkWriteFailed {
        /// Why the bulk command could not execute
        reason: String,
    },

    /// A unique key constraint was violated
    #[error("duplicate key in {collection}: {key}")]
    DuplicateKey {
        /// Collection holding the unique index
        collection: String,
        /// Rendered key value that collided
        key: String,
    },

    /// The store does not support the requested operator or option
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// The caller supplied a malformed filter, update, or pipeline
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Internal store failure
    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether this failure indicates the connection itself dropped, as
    /// opposed to a per-operation problem. The health loop tears down and
    /// reinitializes the pool only for connection-shaped failures.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, StoreError::ConnectionLost(_) | StoreError::Timeout(_))
    }
}

/// Errors raised by the batch pipeline
#[derive(Error, Debug)]
pub enum BatchError {
    /// Execution failed before the bulk command was applied; the drained
    /// operations were restored to the queue so a retry resubmits them
    #[error("batch execution failed, {restored} operations restored for retry: {source}")]
    ExecutionFailed {
        /// Operations returned to the pending queue
        restored: usize,
        /// Underlying store failure
        #[source]
        source: StoreError,
    },

    /// A forced flush failed; the queue was cleared regardless so memory
    /// cannot grow unbounded
    #[error("flush failed, {dropped} pending operations discarded: {source}")]
    FlushFailed {
        /// Operations dropped with the queue
        dropped: usize,
        /// Underlying store failure
        #[source]
        source: StoreError,
    },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_loss_detection() {
        assert!(StoreError::ConnectionLost("reset by peer".into()).is_connection_loss());
        assert!(StoreError::Timeout("find on users".into()).is_connection_loss());
        assert!(!StoreError::Internal("oops".into()).is_connection_loss());
        assert!(!StoreError::DuplicateKey {
            collection: "users".into(),
            key: "user_id=7".into(),
        }
        .is_connection_loss());
    }

    #[test]
    fn test_error_display_includes_context() {
        let err = Error::StoreUnavailable {
            reason: "health check failed".into(),
        };
        assert!(err.to_string().contains("health check failed"));
    }
}
