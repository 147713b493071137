use std::sync::Arc;

use crate::error::StorageResult;
use crate::item::CompletionStatus;
use crate::storage::Storage;

/// Idempotent completion records.
///
/// The first completion of an item id wins; later completions of the same id
/// report `AlreadySeen` so callers can skip re-applying side effects. Records
/// expire after the retention window, after which the id may be reused.
pub struct CompletionTracker {
    storage: Arc<dyn Storage>,
    retention_ms: u64,
}

impl CompletionTracker {
    pub fn new(storage: Arc<dyn Storage>, retention_ms: u64) -> Self {
        Self {
            storage,
            retention_ms,
        }
    }

    /// Record a completion. One conditional write: exactly one caller per
    /// item id ever sees `FirstTime` within the retention window.
    pub fn record(&self, tenant: &str, item_id: &str) -> StorageResult<CompletionStatus> {
        if self.storage.mark_if_new(tenant, item_id, self.retention_ms)? {
            Ok(CompletionStatus::FirstTime)
        } else {
            Ok(CompletionStatus::AlreadySeen)
        }
    }

    /// Whether a live completion record exists for the id.
    pub fn is_complete(&self, tenant: &str, item_id: &str) -> StorageResult<bool> {
        self.storage.is_completed(tenant, item_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn first_record_wins() {
        let tracker = CompletionTracker::new(Arc::new(MemoryStorage::new()), 60_000);
        assert_eq!(tracker.record("t", "a").unwrap(), CompletionStatus::FirstTime);
        assert_eq!(tracker.record("t", "a").unwrap(), CompletionStatus::AlreadySeen);
        assert!(tracker.is_complete("t", "a").unwrap());
    }

    #[test]
    fn records_are_scoped_per_tenant() {
        let tracker = CompletionTracker::new(Arc::new(MemoryStorage::new()), 60_000);
        tracker.record("t", "a").unwrap();
        assert!(!tracker.is_complete("u", "a").unwrap());
        assert_eq!(tracker.record("u", "a").unwrap(), CompletionStatus::FirstTime);
    }

    #[test]
    fn expired_record_allows_reuse() {
        let tracker = CompletionTracker::new(Arc::new(MemoryStorage::new()), 0);
        assert_eq!(tracker.record("t", "a").unwrap(), CompletionStatus::FirstTime);
        // Zero retention: the record lapses immediately and the id is fresh.
        assert!(!tracker.is_complete("t", "a").unwrap());
        assert_eq!(tracker.record("t", "a").unwrap(), CompletionStatus::FirstTime);
    }
}
