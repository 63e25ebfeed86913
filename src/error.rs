//! Error taxonomy for the offline sale queue and sync engine.

use thiserror::Error;

/// Everything that can go wrong inside the sync subsystem.
///
/// Store-level variants propagate to the caller. Submission variants
/// (`NetworkFailure`, `RemoteRejection`) are consumed by the orchestrator's
/// retry loop and only surface as `last_error` text and events.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Durable storage could not be opened or migrated. Sales can still be
    /// taken against a volatile store but will not survive a crash.
    #[error("durable queue store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("idempotency key already queued: {0}")]
    DuplicateIdempotencyKey(String),

    #[error("pending sale not found: {0}")]
    RecordNotFound(String),

    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("server rejected transaction (HTTP {status}): {message}")]
    RemoteRejection { status: u16, message: String },

    #[error("retry budget exhausted for {local_id} after {attempts} attempts: {last_error}")]
    RetryBudgetExhausted {
        local_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("invalid sale payload: {0}")]
    InvalidPayload(String),

    #[error("sqlite: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    LockPoisoned,
}

impl SyncError {
    /// Submission failures the orchestrator retries. Rejections are retried
    /// identically to network errors; the engine cannot tell a permanent
    /// business-rule failure from a transient one.
    pub fn is_submission_failure(&self) -> bool {
        matches!(
            self,
            SyncError::NetworkFailure(_) | SyncError::RemoteRejection { .. }
        )
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self, SyncError::RemoteRejection { .. })
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
