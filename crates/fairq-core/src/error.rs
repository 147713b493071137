/// Low-level storage errors (Redis transport, scripts, data decoding).
/// This is the error type for the `Storage` trait: storage operations can only
/// fail with infrastructure errors, never domain errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("redis error: {0}")]
    Redis(String),

    #[error("corrupt data: {0}")]
    CorruptData(String),
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        StorageError::Redis(err.to_string())
    }
}

/// Errors surfaced to enqueuing callers.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// The tenant's pending queue is at its configured ceiling. Retryable
    /// once the tenant drains.
    #[error("tenant {tenant} has {pending} pending items (ceiling {ceiling})")]
    CapacityExceeded {
        tenant: String,
        pending: u64,
        ceiling: u64,
    },

    /// The item id was already enqueued or already completed for this tenant.
    #[error("duplicate item id {0}")]
    DuplicateItemId(String),

    /// Identifier is empty or contains a byte reserved by the key layout.
    #[error("invalid {field}: {value:?}")]
    InvalidId { field: &'static str, value: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors from the completion/drop paths.
#[derive(Debug, thiserror::Error)]
pub enum CompleteError {
    /// No in-flight claim exists for the handle. The claim was already
    /// released, or the visibility timeout elapsed and the reclaim loop
    /// took it back.
    #[error("no in-flight claim for item {item_id} of tenant {tenant}")]
    ClaimNotFound { tenant: String, item_id: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors starting the background threads (consumer pool, reclaim loop).
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn {name} thread: {source}")]
    Thread {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the operational/repair interface.
#[derive(Debug, thiserror::Error)]
pub enum OpsError {
    #[error("no in-flight claim found for item {0}")]
    ClaimNotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
