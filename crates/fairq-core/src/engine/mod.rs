#[cfg(test)]
mod tests;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::completion::CompletionTracker;
use crate::concurrency::ConcurrencyManager;
use crate::config::FairQueueConfig;
use crate::drr::DrrScheduler;
use crate::error::{CompleteError, EnqueueError, OpsError, StorageResult};
use crate::item::{ClaimHandle, CompletionStatus, Delivery, Item};
use crate::storage::{keys, EnqueueStatus, MasterEntry, Storage};
use crate::visibility::VisibilityManager;

/// Point-in-time view of one tenant for the ops interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantStats {
    pub tenant_id: String,
    pub pending: u64,
    pub in_flight: u64,
    pub deficit: i64,
    pub limit: u64,
}

/// The queue engine: composes the DRR scheduler, concurrency tokens,
/// visibility tracking, and completion records over one storage backend.
///
/// All methods take `&self` and the engine is `Send + Sync`; consumers,
/// producers, and the reclaim loop share one instance behind an `Arc`.
pub struct FairQueue {
    storage: Arc<dyn Storage>,
    scheduler: DrrScheduler,
    concurrency: ConcurrencyManager,
    visibility: VisibilityManager,
    tracker: CompletionTracker,
    config: FairQueueConfig,
}

impl FairQueue {
    pub fn new(storage: Arc<dyn Storage>, config: FairQueueConfig) -> Self {
        let scheduler = DrrScheduler::new(
            Arc::clone(&storage),
            config.scheduler.shard_count,
            config.scheduler.quantum,
            config.scheduler.max_deficit,
            config.limits.default_concurrency,
        );
        let concurrency =
            ConcurrencyManager::new(Arc::clone(&storage), config.limits.default_concurrency);
        let visibility = VisibilityManager::new(
            Arc::clone(&storage),
            config.visibility.timeout_ms,
            config.scheduler.shard_count,
        );
        let tracker =
            CompletionTracker::new(Arc::clone(&storage), config.limits.idempotency_retention_ms);
        Self {
            storage,
            scheduler,
            concurrency,
            visibility,
            tracker,
            config,
        }
    }

    pub fn config(&self) -> &FairQueueConfig {
        &self.config
    }

    pub(crate) fn visibility(&self) -> &VisibilityManager {
        &self.visibility
    }

    /// Admit one item. The item id doubles as the idempotency key: ids with a
    /// live record or completion marker are rejected as duplicates.
    pub fn enqueue(
        &self,
        tenant_id: &str,
        item_id: &str,
        payload_ref: &str,
    ) -> Result<(), EnqueueError> {
        validate_id("tenant_id", tenant_id)?;
        validate_id("item_id", item_id)?;

        let item = Item {
            tenant_id: tenant_id.to_string(),
            item_id: item_id.to_string(),
            payload_ref: payload_ref.to_string(),
            enqueued_at: VisibilityManager::now_ms(),
            attempt: 0,
        };
        let shard = keys::shard_of(tenant_id, self.config.scheduler.shard_count);
        let ceiling = self.config.limits.max_pending_per_tenant;
        match self.storage.enqueue_item(&item, shard, ceiling)? {
            EnqueueStatus::Accepted => {
                debug!(tenant = tenant_id, item = item_id, shard, "item enqueued");
                Ok(())
            }
            EnqueueStatus::DuplicateItemId => {
                Err(EnqueueError::DuplicateItemId(item_id.to_string()))
            }
            EnqueueStatus::CapacityExceeded { pending } => Err(EnqueueError::CapacityExceeded {
                tenant: tenant_id.to_string(),
                pending,
                ceiling,
            }),
        }
    }

    /// Claim the next item for `consumer_id`, or None when no tenant has
    /// claimable work.
    ///
    /// Scheduling and token acquisition are separate atomic steps, so a
    /// selected tenant can lose its last slot to a racing claimer; the loop
    /// refunds the debited scheduling credit and re-runs scheduling once
    /// before reporting no work. A pop that finds the queue empty (drained
    /// between passes) returns the token and retries the same way.
    pub fn claim(&self, consumer_id: &str) -> StorageResult<Option<Delivery>> {
        for _ in 0..2 {
            let Some(tenant) = self.scheduler.next_tenant()? else {
                return Ok(None);
            };
            let Some(token) = self.concurrency.try_acquire(&tenant)? else {
                // Selection already debited a credit for this claim.
                self.storage.refund_credit(&tenant)?;
                debug!(%tenant, "tenant hit concurrency ceiling between passes");
                continue;
            };
            let deadline = self.visibility.deadline_from(VisibilityManager::now_ms());
            match self
                .storage
                .pop_and_track(&tenant, consumer_id, &token, deadline)?
            {
                Some(item) => {
                    debug!(
                        %tenant,
                        item = %item.item_id,
                        attempt = item.attempt,
                        consumer = consumer_id,
                        "item claimed"
                    );
                    return Ok(Some(Delivery {
                        handle: ClaimHandle {
                            tenant_id: item.tenant_id.clone(),
                            item_id: item.item_id.clone(),
                            consumer_id: consumer_id.to_string(),
                        },
                        item,
                    }));
                }
                None => {
                    // Queue drained between scheduling and pop.
                    self.concurrency.release(&tenant, &token)?;
                }
            }
        }
        Ok(None)
    }

    /// Complete a claimed item: record the completion marker, then release
    /// the claim and its token in one atomic step.
    ///
    /// `AlreadySeen` means this item id was completed before (a redelivery
    /// caught up after the fact); the caller must not re-apply side effects.
    /// If the claim is already gone the marker still stands, so the requeued
    /// copy will be dropped on its next delivery.
    pub fn complete(&self, handle: &ClaimHandle) -> Result<CompletionStatus, CompleteError> {
        let status = self.tracker.record(&handle.tenant_id, &handle.item_id)?;
        if !self.storage.release_claim(&handle.tenant_id, &handle.item_id)? {
            warn!(
                tenant = %handle.tenant_id,
                item = %handle.item_id,
                "completion arrived after the claim was reclaimed"
            );
            return Err(CompleteError::ClaimNotFound {
                tenant: handle.tenant_id.clone(),
                item_id: handle.item_id.clone(),
            });
        }
        Ok(status)
    }

    /// Discard a claimed item without recording a completion marker. The
    /// item will not be redelivered; its id stays free for re-enqueue.
    pub fn drop_item(&self, handle: &ClaimHandle, reason: &str) -> Result<(), CompleteError> {
        if !self.storage.release_claim(&handle.tenant_id, &handle.item_id)? {
            return Err(CompleteError::ClaimNotFound {
                tenant: handle.tenant_id.clone(),
                item_id: handle.item_id.clone(),
            });
        }
        warn!(
            tenant = %handle.tenant_id,
            item = %handle.item_id,
            reason,
            "item dropped without completion"
        );
        Ok(())
    }

    /// Heartbeat for long-running handlers: push the claim's visibility
    /// deadline one full timeout forward. False if the claim is gone.
    pub fn extend_claim(&self, handle: &ClaimHandle) -> StorageResult<bool> {
        self.visibility.extend(&handle.tenant_id, &handle.item_id)
    }

    /// Whether a live completion marker exists for the id.
    pub fn is_complete(&self, tenant_id: &str, item_id: &str) -> StorageResult<bool> {
        self.tracker.is_complete(tenant_id, item_id)
    }

    // --- Ops / repair interface ---

    pub fn tenant_stats(&self, tenant_id: &str) -> StorageResult<TenantStats> {
        Ok(TenantStats {
            tenant_id: tenant_id.to_string(),
            pending: self.storage.pending_count(tenant_id)?,
            in_flight: self.concurrency.count(tenant_id)?,
            deficit: self.storage.deficit(tenant_id)?,
            limit: self.concurrency.effective_limit(tenant_id)?,
        })
    }

    /// Master-index entries of one shard whose tenant has no pending work.
    /// Harmless (the next DRR pass over the shard removes them) but listed
    /// so operators can tell them apart from real backlog.
    pub fn stale_entries(&self, shard: u32) -> StorageResult<Vec<MasterEntry>> {
        Ok(self
            .storage
            .shard_entries(shard)?
            .into_iter()
            .filter(|entry| entry.pending == 0)
            .collect())
    }

    /// Drop a leaked concurrency token. False if the token was not held.
    pub fn force_release_token(&self, tenant_id: &str, token: &str) -> StorageResult<bool> {
        let released = self.concurrency.release(tenant_id, token)?;
        if released {
            warn!(tenant = tenant_id, token, "token force-released");
        }
        Ok(released)
    }

    /// Return an in-flight item to its queue regardless of its deadline.
    /// Looks the claim up by item id alone.
    pub fn force_reclaim(&self, item_id: &str) -> Result<String, OpsError> {
        let Some(tenant) = self.storage.find_claim(item_id)? else {
            return Err(OpsError::ClaimNotFound(item_id.to_string()));
        };
        if !self.visibility.force_reclaim(&tenant, item_id)? {
            return Err(OpsError::ClaimNotFound(item_id.to_string()));
        }
        warn!(%tenant, item = item_id, "claim force-reclaimed");
        Ok(tenant)
    }

    pub fn set_concurrency_limit(
        &self,
        tenant_id: &str,
        limit: Option<u64>,
    ) -> StorageResult<()> {
        self.concurrency.set_limit(tenant_id, limit)
    }
}

/// Identifiers appear in key names and index members, so the separator byte
/// and empty strings are rejected at the door.
fn validate_id(field: &'static str, value: &str) -> Result<(), EnqueueError> {
    if value.is_empty() || value.contains(keys::MEMBER_SEP) || value.contains(':') {
        return Err(EnqueueError::InvalidId {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}
