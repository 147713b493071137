use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::StorageResult;
use crate::storage::Storage;

/// Deficit round-robin tenant selection over the sharded master index.
///
/// Each `next_tenant` call walks the shards starting at a rotating cursor and
/// runs one DRR pass per shard until a pass yields a tenant. The pass itself
/// (credit, cap, drain cleanup, debit) is a single atomic storage operation;
/// this type only decides which shard to ask next.
pub struct DrrScheduler {
    storage: Arc<dyn Storage>,
    shard_count: u32,
    quantum: i64,
    max_deficit: i64,
    default_limit: u64,
    cursor: AtomicUsize,
}

impl DrrScheduler {
    pub fn new(
        storage: Arc<dyn Storage>,
        shard_count: u32,
        quantum: i64,
        max_deficit: i64,
        default_limit: u64,
    ) -> Self {
        Self {
            storage,
            shard_count: shard_count.max(1),
            quantum,
            max_deficit,
            default_limit,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Pick the next tenant to serve, or None when no tenant in any shard is
    /// both backlogged and below its concurrency ceiling. The winning tenant
    /// has already been debited one credit.
    pub fn next_tenant(&self) -> StorageResult<Option<String>> {
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..self.shard_count as usize {
            let shard = ((start + offset) % self.shard_count as usize) as u32;
            if let Some(tenant) = self.storage.select_tenant(
                shard,
                self.quantum,
                self.max_deficit,
                self.default_limit,
            )? {
                return Ok(Some(tenant));
            }
        }
        Ok(None)
    }
}
