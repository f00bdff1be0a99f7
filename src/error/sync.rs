use thiserror::Error;

/// Failure taxonomy of the offline cache, the pending queue and the sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Local storage is inaccessible or holds undecodable records. Callers
    /// degrade to network-only operation.
    #[error("local cache unavailable: {0}")]
    CacheUnavailable(String),
    /// Transient transport or server failure; retried on the next trigger.
    #[error("network failure: {0}")]
    NetworkFailure(String),
    /// The server's task version moved past the version the mutation was based on.
    #[error("task {task_id} is at version {actual}, mutation expected {expected}")]
    VersionConflict {
        task_id: String,
        expected: i64,
        actual: i64,
    },
    /// Terminal for the entry or request it concerns.
    #[error("{0}")]
    ValidationFailure(String),
    /// A persisted queue row could not be decoded.
    #[error("queue entry {local_id} is corrupt: {reason}")]
    QueueCorruption { local_id: String, reason: String },
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub const CACHE_UNAVAILABLE_CODE: &'static str = "SYNC/CACHE_UNAVAILABLE";
    pub const NETWORK_CODE: &'static str = "SYNC/NETWORK";
    pub const CONFLICT_CODE: &'static str = "SYNC/CONFLICT";
    pub const VALIDATION_CODE: &'static str = "SYNC/VALIDATION";
    pub const QUEUE_CORRUPT_CODE: &'static str = "SYNC/QUEUE_CORRUPT";

    pub fn code(&self) -> &'static str {
        match self {
            SyncError::CacheUnavailable(_) => Self::CACHE_UNAVAILABLE_CODE,
            SyncError::NetworkFailure(_) => Self::NETWORK_CODE,
            SyncError::VersionConflict { .. } => Self::CONFLICT_CODE,
            SyncError::ValidationFailure(_) => Self::VALIDATION_CODE,
            SyncError::QueueCorruption { .. } => Self::QUEUE_CORRUPT_CODE,
        }
    }

    /// Whether the failure should halt a pass and be retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::NetworkFailure(_))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        SyncError::ValidationFailure(message.into())
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(error: sqlx::Error) -> Self {
        SyncError::CacheUnavailable(error.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::CacheUnavailable(format!("corrupted record: {error}"))
    }
}
