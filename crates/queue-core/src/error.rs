//! Error taxonomy: each variant names the failure class rather than
//! wrapping a bare string, so callers can match on it instead of grepping
//! messages.

use thiserror::Error;

/// Errors surfaced by the domain layer and every storage backend that
/// implements [`crate::job_store::JobStore`].
#[derive(Error, Debug)]
pub enum QueueError {
    /// A caller-supplied argument failed admission validation. Surfaced
    /// synchronously to the caller; never forwarded to the error event bus.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The storage layer rejected or failed a statement for a reason other
    /// than claim contention. Forwarded to the error event bus and
    /// rethrown to the caller.
    #[error("storage error: {0}")]
    Storage(String),

    /// `fetch` hit a lock-wait timeout while contending with another
    /// fetcher. This is the first-class re-model of the source's
    /// lock-wait-timeout swallowing: callers that see this should simply
    /// treat the batch as empty, not treat it as a hard failure.
    #[error("claim contention: lock wait timed out")]
    ClaimContention,

    /// A schedule referenced a queue that does not exist. This is the
    /// user-facing remap of the underlying foreign-key violation.
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// The user-supplied worker callback failed (panicked, returned an
    /// error, or exceeded its timeout).
    #[error("job callback failed: {0}")]
    CallbackFailed(String),
}

impl QueueError {
    /// Whether this error class should be forwarded to the `error` event
    /// bus (see §7 of the design: validation failures never are).
    pub fn is_observable(&self) -> bool {
        !matches!(self, Self::Validation(_))
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_not_observable() {
        assert!(!QueueError::Validation("bad".into()).is_observable());
    }

    #[test]
    fn storage_errors_are_observable() {
        assert!(QueueError::Storage("connection reset".into()).is_observable());
        assert!(QueueError::ClaimContention.is_observable());
        assert!(QueueError::QueueNotFound("q".into()).is_observable());
        assert!(QueueError::CallbackFailed("boom".into()).is_observable());
    }
}
