use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::StorageResult;
use crate::storage::{keys, ExpiredClaim, Storage};

/// Visibility-timeout tracking over the shared in-flight index.
///
/// Claims are tracked at pop time by the storage layer; this type owns the
/// deadline arithmetic, heartbeat extension, and the per-item reclaim step.
pub struct VisibilityManager {
    storage: Arc<dyn Storage>,
    timeout_ms: u64,
    shard_count: u32,
}

impl VisibilityManager {
    pub fn new(storage: Arc<dyn Storage>, timeout_ms: u64, shard_count: u32) -> Self {
        Self {
            storage,
            timeout_ms,
            shard_count,
        }
    }

    pub fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Deadline for a claim taken at `now_ms`.
    pub fn deadline_from(&self, now_ms: u64) -> u64 {
        now_ms.saturating_add(self.timeout_ms)
    }

    /// Heartbeat: push a live claim's deadline one full timeout into the
    /// future. Returns false if the claim is gone (completed or reclaimed).
    pub fn extend(&self, tenant: &str, item_id: &str) -> StorageResult<bool> {
        let deadline = self.deadline_from(Self::now_ms());
        self.storage.extend_claim(tenant, item_id, deadline)
    }

    /// Claims whose deadline has passed, earliest first.
    pub fn expired(&self, now_ms: u64, limit: usize) -> StorageResult<Vec<ExpiredClaim>> {
        self.storage.list_expired(now_ms, limit)
    }

    /// Return one expired claim to its tenant queue. The storage step
    /// re-checks expiry, so a claim completed or extended between the scan
    /// and this call is left alone and false is returned.
    pub fn reclaim(&self, tenant: &str, item_id: &str, now_ms: u64) -> StorageResult<bool> {
        let shard = keys::shard_of(tenant, self.shard_count);
        self.storage
            .reclaim_claim(tenant, item_id, shard, now_ms, false)
    }

    /// Repair-path reclaim that ignores the deadline.
    pub fn force_reclaim(&self, tenant: &str, item_id: &str) -> StorageResult<bool> {
        let shard = keys::shard_of(tenant, self.shard_count);
        self.storage
            .reclaim_claim(tenant, item_id, shard, Self::now_ms(), true)
    }
}
