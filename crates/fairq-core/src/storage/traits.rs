use crate::error::StorageResult;
use crate::item::Item;

/// Admission result for an enqueue attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueStatus {
    Accepted,
    /// Pending queue at the configured ceiling; carries the observed depth.
    CapacityExceeded { pending: u64 },
    DuplicateItemId,
}

/// One expired in-flight claim, as reported by `list_expired`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredClaim {
    pub tenant_id: String,
    pub item_id: String,
    /// Consumer that abandoned the claim, for the reclaim log.
    pub consumer_id: String,
    pub expired_at: u64,
}

/// One master-index entry with the reads the repair tool needs to judge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterEntry {
    pub tenant_id: String,
    pub pending: u64,
    pub deficit: i64,
    pub tokens: u64,
}

/// Storage backend for all queue state. Implementations must be thread-safe,
/// and every method that mutates more than one key MUST apply its mutations
/// atomically: the Redis backend runs each as a single server-side script,
/// the in-memory backend as one state transition under its mutex. No
/// finer-grained mutation primitives are exposed, so a partial multi-key
/// write cannot be expressed by callers at all.
pub trait Storage: Send + Sync {
    // --- Enqueue ---

    /// Admit an item: create its record, append it to the tenant queue, and
    /// ensure the tenant's master-index entry in `shard`. Rejects duplicates
    /// (live or completed item ids) and full tenant queues. `max_pending` of
    /// zero disables the capacity ceiling.
    fn enqueue_item(&self, item: &Item, shard: u32, max_pending: u64)
        -> StorageResult<EnqueueStatus>;

    // --- DRR scheduling ---

    /// Run one deficit round-robin pass over `shard`'s master index, starting
    /// at the shard's rotation cursor: credit `quantum` to each visited tenant
    /// with pending work (capped at `max_deficit`), drop drained tenants from
    /// the index (zeroing their deficit), and return the first visited tenant
    /// with deficit >= 1 that is below its concurrency ceiling, debiting one
    /// credit and advancing the cursor past it. The cursor is what keeps
    /// service rotating among continuously backlogged tenants instead of
    /// pinning the head of the index.
    fn select_tenant(
        &self,
        shard: u32,
        quantum: i64,
        max_deficit: i64,
        default_limit: u64,
    ) -> StorageResult<Option<String>>;

    /// Give one credit back to a tenant whose selection went unused because
    /// the subsequent token grant was refused (a racing claimer took the
    /// tenant's last slot). Single-counter increment.
    fn refund_credit(&self, tenant: &str) -> StorageResult<()>;

    // --- Concurrency tokens ---

    /// Conditionally add `token` to the tenant's token set if the set is below
    /// the tenant's limit (override or `default_limit`). Returns false when
    /// the ceiling is reached (Denied).
    fn acquire_token(&self, tenant: &str, token: &str, default_limit: u64)
        -> StorageResult<bool>;

    /// Remove a token. Idempotent: removing an absent token returns false and
    /// is not an error (the completion and reclaim paths may race).
    fn release_token(&self, tenant: &str, token: &str) -> StorageResult<bool>;

    fn token_count(&self, tenant: &str) -> StorageResult<u64>;

    /// Set or clear the tenant's concurrency limit override.
    fn set_limit(&self, tenant: &str, limit: Option<u64>) -> StorageResult<()>;

    fn limit(&self, tenant: &str) -> StorageResult<Option<u64>>;

    // --- Claim lifecycle ---

    /// Pop the oldest pending item of `tenant` and track it in-flight with the
    /// given claim metadata, all in one step. Returns None when the queue is
    /// empty (claim race); the caller must release the token it acquired.
    fn pop_and_track(
        &self,
        tenant: &str,
        consumer_id: &str,
        token: &str,
        expiry_ms: u64,
    ) -> StorageResult<Option<Item>>;

    /// Push a claim's expiry forward (heartbeat for long-running handlers).
    /// Returns false if the claim no longer exists.
    fn extend_claim(&self, tenant: &str, item_id: &str, new_expiry_ms: u64)
        -> StorageResult<bool>;

    /// Terminal release: atomically delete the claim, its expiry entry, and
    /// the item record, and release the claim's recorded token. Used by both
    /// completion and explicit drop. Returns false if no claim existed.
    fn release_claim(&self, tenant: &str, item_id: &str) -> StorageResult<bool>;

    /// List up to `limit` in-flight claims whose expiry is <= `now_ms`,
    /// earliest first. Read-only; the per-item `reclaim_claim` is the atomic
    /// recovery unit.
    fn list_expired(&self, now_ms: u64, limit: usize) -> StorageResult<Vec<ExpiredClaim>>;

    /// Atomically return an expired claim to its tenant queue: delete the
    /// claim and expiry entry, increment the item's attempt counter,
    /// re-enqueue at queue tail (scored `now_ms`), re-ensure the tenant's
    /// master-index entry in `shard`, and release the claim's token. With
    /// `force`, skips the expiry check (repair path). Returns false if no
    /// claim existed or (without `force`) the claim has not expired.
    fn reclaim_claim(
        &self,
        tenant: &str,
        item_id: &str,
        shard: u32,
        now_ms: u64,
        force: bool,
    ) -> StorageResult<bool>;

    /// Locate the tenant currently holding `item_id` in flight, if any.
    /// Scans the expiry index; repair-tool path only.
    fn find_claim(&self, item_id: &str) -> StorageResult<Option<String>>;

    // --- Completion records ---

    /// Record a completion marker with the retention TTL if none exists.
    /// Returns true on first record, false when one was already present.
    /// A zero retention lapses immediately: no durable marker is kept and
    /// the call reports first-record status against any live marker.
    fn mark_if_new(&self, tenant: &str, item_id: &str, retention_ms: u64)
        -> StorageResult<bool>;

    fn is_completed(&self, tenant: &str, item_id: &str) -> StorageResult<bool>;

    // --- Reads for the ops interface ---

    fn pending_count(&self, tenant: &str) -> StorageResult<u64>;

    fn deficit(&self, tenant: &str) -> StorageResult<i64>;

    /// All master-index entries of one shard, in index order, with the
    /// per-tenant reads needed to judge staleness.
    fn shard_entries(&self, shard: u32) -> StorageResult<Vec<MasterEntry>>;
}
