use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{StorageError, StorageResult};
use crate::item::Item;
use crate::storage::traits::{EnqueueStatus, ExpiredClaim, MasterEntry, Storage};

#[derive(Debug, Clone)]
struct ItemRecord {
    payload_ref: String,
    enqueued_at: u64,
    attempt: u32,
}

#[derive(Debug, Clone)]
struct ClaimRecord {
    consumer_id: String,
    token: String,
    expiry: u64,
}

/// All queue state behind one mutex. Every `Storage` method acquires the lock
/// exactly once, so each method is a single atomic transition, the in-memory
/// equivalent of one server-side script.
#[derive(Default)]
struct MemoryState {
    /// (tenant, item) -> record. Lives from enqueue until terminal release.
    items: HashMap<(String, String), ItemRecord>,
    /// Pending queues: (score, insertion seq) -> item id, FIFO within tenant.
    queues: HashMap<String, BTreeMap<(u64, u64), String>>,
    /// Master index shards in insertion order.
    shards: HashMap<u32, Vec<String>>,
    deficits: HashMap<String, i64>,
    /// Per-shard DRR rotation cursors.
    cursors: HashMap<u32, usize>,
    tokens: HashMap<String, HashSet<String>>,
    limits: HashMap<String, u64>,
    claims: HashMap<(String, String), ClaimRecord>,
    /// Completion markers with their retention deadline.
    done: HashMap<(String, String), u64>,
    seq: u64,
}

/// In-memory `Storage` implementation with the same atomicity contract as the
/// Redis backend. Used by tests and embedded single-process callers.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

fn ensure_shard_entry(state: &mut MemoryState, shard: u32, tenant: &str) {
    let entries = state.shards.entry(shard).or_default();
    if !entries.iter().any(|t| t == tenant) {
        entries.push(tenant.to_string());
    }
}

fn completed(state: &MemoryState, tenant: &str, item_id: &str, now_ms: u64) -> bool {
    state
        .done
        .get(&(tenant.to_string(), item_id.to_string()))
        .is_some_and(|deadline| *deadline > now_ms)
}

impl Storage for MemoryStorage {
    fn enqueue_item(
        &self,
        item: &Item,
        shard: u32,
        max_pending: u64,
    ) -> StorageResult<EnqueueStatus> {
        let mut state = self.state();
        let key = (item.tenant_id.clone(), item.item_id.clone());
        if state.items.contains_key(&key)
            || completed(&state, &item.tenant_id, &item.item_id, Self::now_ms())
        {
            return Ok(EnqueueStatus::DuplicateItemId);
        }
        let pending = state
            .queues
            .get(&item.tenant_id)
            .map(|q| q.len() as u64)
            .unwrap_or(0);
        if max_pending > 0 && pending >= max_pending {
            return Ok(EnqueueStatus::CapacityExceeded { pending });
        }

        state.items.insert(
            key,
            ItemRecord {
                payload_ref: item.payload_ref.clone(),
                enqueued_at: item.enqueued_at,
                attempt: item.attempt,
            },
        );
        state.seq += 1;
        let seq = state.seq;
        state
            .queues
            .entry(item.tenant_id.clone())
            .or_default()
            .insert((item.enqueued_at, seq), item.item_id.clone());
        ensure_shard_entry(&mut state, shard, &item.tenant_id);
        Ok(EnqueueStatus::Accepted)
    }

    fn select_tenant(
        &self,
        shard: u32,
        quantum: i64,
        max_deficit: i64,
        default_limit: u64,
    ) -> StorageResult<Option<String>> {
        let mut state = self.state();
        let tenants: Vec<String> = state.shards.get(&shard).cloned().unwrap_or_default();
        if tenants.is_empty() {
            return Ok(None);
        }
        let start = state.cursors.get(&shard).copied().unwrap_or(0) % tenants.len();

        for i in 0..tenants.len() {
            let pos = (start + i) % tenants.len();
            let tenant = tenants[pos].clone();
            let pending = state.queues.get(&tenant).map(BTreeMap::len).unwrap_or(0);
            if pending == 0 {
                // Drained: floor the deficit and drop the master entry.
                state.deficits.remove(&tenant);
                if let Some(entries) = state.shards.get_mut(&shard) {
                    entries.retain(|t| t != &tenant);
                }
                continue;
            }
            let mut deficit = state.deficits.get(&tenant).copied().unwrap_or(0) + quantum;
            if deficit > max_deficit {
                deficit = max_deficit;
            }
            let limit = state.limits.get(&tenant).copied().unwrap_or(default_limit);
            let held = state.tokens.get(&tenant).map(HashSet::len).unwrap_or(0) as u64;
            if deficit >= 1 && held < limit {
                state.deficits.insert(tenant.clone(), deficit - 1);
                state.cursors.insert(shard, pos + 1);
                return Ok(Some(tenant));
            }
            state.deficits.insert(tenant, deficit);
        }
        Ok(None)
    }

    fn refund_credit(&self, tenant: &str) -> StorageResult<()> {
        let mut state = self.state();
        *state.deficits.entry(tenant.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn acquire_token(
        &self,
        tenant: &str,
        token: &str,
        default_limit: u64,
    ) -> StorageResult<bool> {
        let mut state = self.state();
        let limit = state.limits.get(tenant).copied().unwrap_or(default_limit);
        let held = state.tokens.entry(tenant.to_string()).or_default();
        if held.len() as u64 >= limit {
            return Ok(false);
        }
        held.insert(token.to_string());
        Ok(true)
    }

    fn release_token(&self, tenant: &str, token: &str) -> StorageResult<bool> {
        let mut state = self.state();
        Ok(state
            .tokens
            .get_mut(tenant)
            .is_some_and(|held| held.remove(token)))
    }

    fn token_count(&self, tenant: &str) -> StorageResult<u64> {
        let state = self.state();
        Ok(state.tokens.get(tenant).map(HashSet::len).unwrap_or(0) as u64)
    }

    fn set_limit(&self, tenant: &str, limit: Option<u64>) -> StorageResult<()> {
        let mut state = self.state();
        match limit {
            Some(limit) => state.limits.insert(tenant.to_string(), limit),
            None => state.limits.remove(tenant),
        };
        Ok(())
    }

    fn limit(&self, tenant: &str) -> StorageResult<Option<u64>> {
        Ok(self.state().limits.get(tenant).copied())
    }

    fn pop_and_track(
        &self,
        tenant: &str,
        consumer_id: &str,
        token: &str,
        expiry_ms: u64,
    ) -> StorageResult<Option<Item>> {
        let mut state = self.state();
        let Some(queue) = state.queues.get_mut(tenant) else {
            return Ok(None);
        };
        let Some((&slot, _)) = queue.iter().next() else {
            return Ok(None);
        };
        let item_id = queue.remove(&slot).unwrap_or_default();

        let key = (tenant.to_string(), item_id.clone());
        let record = state.items.get(&key).cloned().ok_or_else(|| {
            StorageError::CorruptData(format!("queued item {item_id} has no record"))
        })?;
        state.claims.insert(
            key,
            ClaimRecord {
                consumer_id: consumer_id.to_string(),
                token: token.to_string(),
                expiry: expiry_ms,
            },
        );
        Ok(Some(Item {
            tenant_id: tenant.to_string(),
            item_id,
            payload_ref: record.payload_ref,
            enqueued_at: record.enqueued_at,
            attempt: record.attempt,
        }))
    }

    fn extend_claim(
        &self,
        tenant: &str,
        item_id: &str,
        new_expiry_ms: u64,
    ) -> StorageResult<bool> {
        let mut state = self.state();
        match state
            .claims
            .get_mut(&(tenant.to_string(), item_id.to_string()))
        {
            Some(claim) => {
                claim.expiry = new_expiry_ms;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn release_claim(&self, tenant: &str, item_id: &str) -> StorageResult<bool> {
        let mut state = self.state();
        let key = (tenant.to_string(), item_id.to_string());
        let Some(claim) = state.claims.remove(&key) else {
            return Ok(false);
        };
        state.items.remove(&key);
        if let Some(held) = state.tokens.get_mut(tenant) {
            held.remove(&claim.token);
        }
        Ok(true)
    }

    fn list_expired(&self, now_ms: u64, limit: usize) -> StorageResult<Vec<ExpiredClaim>> {
        let state = self.state();
        let mut expired: Vec<ExpiredClaim> = state
            .claims
            .iter()
            .filter(|(_, claim)| claim.expiry <= now_ms)
            .map(|((tenant, item), claim)| ExpiredClaim {
                tenant_id: tenant.clone(),
                item_id: item.clone(),
                consumer_id: claim.consumer_id.clone(),
                expired_at: claim.expiry,
            })
            .collect();
        expired.sort_by_key(|c| c.expired_at);
        expired.truncate(limit);
        Ok(expired)
    }

    fn reclaim_claim(
        &self,
        tenant: &str,
        item_id: &str,
        shard: u32,
        now_ms: u64,
        force: bool,
    ) -> StorageResult<bool> {
        let mut state = self.state();
        let key = (tenant.to_string(), item_id.to_string());
        let Some(claim) = state.claims.get(&key) else {
            return Ok(false);
        };
        if !force && claim.expiry > now_ms {
            return Ok(false);
        }
        let claim = state.claims.remove(&key).unwrap_or(ClaimRecord {
            consumer_id: String::new(),
            token: String::new(),
            expiry: 0,
        });
        let record = state.items.get_mut(&key).ok_or_else(|| {
            StorageError::CorruptData(format!("in-flight item {item_id} has no record"))
        })?;
        record.attempt += 1;
        state.seq += 1;
        let seq = state.seq;
        state
            .queues
            .entry(tenant.to_string())
            .or_default()
            .insert((now_ms, seq), item_id.to_string());
        ensure_shard_entry(&mut state, shard, tenant);
        if let Some(held) = state.tokens.get_mut(tenant) {
            held.remove(&claim.token);
        }
        Ok(true)
    }

    fn find_claim(&self, item_id: &str) -> StorageResult<Option<String>> {
        let state = self.state();
        Ok(state
            .claims
            .keys()
            .find(|(_, item)| item == item_id)
            .map(|(tenant, _)| tenant.clone()))
    }

    fn mark_if_new(
        &self,
        tenant: &str,
        item_id: &str,
        retention_ms: u64,
    ) -> StorageResult<bool> {
        let mut state = self.state();
        let now = Self::now_ms();
        let key = (tenant.to_string(), item_id.to_string());
        if state.done.get(&key).is_some_and(|deadline| *deadline > now) {
            return Ok(false);
        }
        state.done.insert(key, now.saturating_add(retention_ms));
        Ok(true)
    }

    fn is_completed(&self, tenant: &str, item_id: &str) -> StorageResult<bool> {
        let state = self.state();
        Ok(completed(&state, tenant, item_id, Self::now_ms()))
    }

    fn pending_count(&self, tenant: &str) -> StorageResult<u64> {
        let state = self.state();
        Ok(state.queues.get(tenant).map(BTreeMap::len).unwrap_or(0) as u64)
    }

    fn deficit(&self, tenant: &str) -> StorageResult<i64> {
        Ok(self.state().deficits.get(tenant).copied().unwrap_or(0))
    }

    fn shard_entries(&self, shard: u32) -> StorageResult<Vec<MasterEntry>> {
        let state = self.state();
        let tenants = state.shards.get(&shard).cloned().unwrap_or_default();
        Ok(tenants
            .into_iter()
            .map(|tenant| MasterEntry {
                pending: state.queues.get(&tenant).map(BTreeMap::len).unwrap_or(0) as u64,
                deficit: state.deficits.get(&tenant).copied().unwrap_or(0),
                tokens: state.tokens.get(&tenant).map(HashSet::len).unwrap_or(0) as u64,
                tenant_id: tenant,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(tenant: &str, id: &str, at: u64) -> Item {
        Item {
            tenant_id: tenant.to_string(),
            item_id: id.to_string(),
            payload_ref: format!("ref/{id}"),
            enqueued_at: at,
            attempt: 0,
        }
    }

    #[test]
    fn enqueue_rejects_duplicates_and_capacity() {
        let storage = MemoryStorage::new();
        assert_eq!(
            storage.enqueue_item(&item("t", "a", 1), 0, 2).unwrap(),
            EnqueueStatus::Accepted
        );
        assert_eq!(
            storage.enqueue_item(&item("t", "a", 2), 0, 2).unwrap(),
            EnqueueStatus::DuplicateItemId
        );
        storage.enqueue_item(&item("t", "b", 2), 0, 2).unwrap();
        assert_eq!(
            storage.enqueue_item(&item("t", "c", 3), 0, 2).unwrap(),
            EnqueueStatus::CapacityExceeded { pending: 2 }
        );
    }

    #[test]
    fn pop_is_fifo_within_tenant() {
        let storage = MemoryStorage::new();
        storage.enqueue_item(&item("t", "a", 10), 0, 0).unwrap();
        storage.enqueue_item(&item("t", "b", 20), 0, 0).unwrap();
        let first = storage.pop_and_track("t", "c1", "tok1", 100).unwrap().unwrap();
        assert_eq!(first.item_id, "a");
        let second = storage.pop_and_track("t", "c1", "tok2", 100).unwrap().unwrap();
        assert_eq!(second.item_id, "b");
        assert!(storage.pop_and_track("t", "c1", "tok3", 100).unwrap().is_none());
    }

    #[test]
    fn release_claim_removes_token_and_record() {
        let storage = MemoryStorage::new();
        storage.enqueue_item(&item("t", "a", 1), 0, 0).unwrap();
        assert!(storage.acquire_token("t", "tok", 4).unwrap());
        storage.pop_and_track("t", "c1", "tok", 100).unwrap().unwrap();
        assert!(storage.release_claim("t", "a").unwrap());
        assert_eq!(storage.token_count("t").unwrap(), 0);
        // Idempotent second release.
        assert!(!storage.release_claim("t", "a").unwrap());
        // The item record is gone, so the id can be admitted again only if
        // no completion marker was recorded.
        assert_eq!(
            storage.enqueue_item(&item("t", "a", 2), 0, 0).unwrap(),
            EnqueueStatus::Accepted
        );
    }

    #[test]
    fn reclaim_requeues_at_tail_and_releases_token() {
        let storage = MemoryStorage::new();
        storage.enqueue_item(&item("t", "a", 1), 0, 0).unwrap();
        storage.enqueue_item(&item("t", "b", 2), 0, 0).unwrap();
        assert!(storage.acquire_token("t", "tok", 4).unwrap());
        storage.pop_and_track("t", "c1", "tok", 50).unwrap().unwrap();

        assert!(storage.reclaim_claim("t", "a", 0, 100, false).unwrap());
        assert_eq!(storage.token_count("t").unwrap(), 0);

        // "a" went to the tail: "b" (score 2) pops before "a" (score 100).
        let next = storage.pop_and_track("t", "c1", "tok2", 200).unwrap().unwrap();
        assert_eq!(next.item_id, "b");
        let last = storage.pop_and_track("t", "c1", "tok3", 200).unwrap().unwrap();
        assert_eq!(last.item_id, "a");
        assert_eq!(last.attempt, 1);
    }

    #[test]
    fn reclaim_respects_expiry_unless_forced() {
        let storage = MemoryStorage::new();
        storage.enqueue_item(&item("t", "a", 1), 0, 0).unwrap();
        storage.acquire_token("t", "tok", 4).unwrap();
        storage.pop_and_track("t", "c1", "tok", 1_000).unwrap().unwrap();

        assert!(!storage.reclaim_claim("t", "a", 0, 500, false).unwrap());
        assert!(storage.reclaim_claim("t", "a", 0, 500, true).unwrap());
    }

    #[test]
    fn completion_markers_are_first_time_once() {
        let storage = MemoryStorage::new();
        assert!(storage.mark_if_new("t", "a", 60_000).unwrap());
        assert!(!storage.mark_if_new("t", "a", 60_000).unwrap());
        assert!(storage.is_completed("t", "a").unwrap());
        // Completed ids are rejected on re-enqueue.
        assert_eq!(
            storage.enqueue_item(&item("t", "a", 1), 0, 0).unwrap(),
            EnqueueStatus::DuplicateItemId
        );
    }

    #[test]
    fn select_tenant_drops_drained_entries() {
        let storage = MemoryStorage::new();
        storage.enqueue_item(&item("t", "a", 1), 3, 0).unwrap();
        let picked = storage.select_tenant(3, 10, 100, 4).unwrap();
        assert_eq!(picked.as_deref(), Some("t"));

        storage.pop_and_track("t", "c1", "tok", 100).unwrap().unwrap();
        // Queue now empty: the pass removes the master entry and resets deficit.
        assert_eq!(storage.select_tenant(3, 10, 100, 4).unwrap(), None);
        assert!(storage.shard_entries(3).unwrap().is_empty());
        assert_eq!(storage.deficit("t").unwrap(), 0);
    }

    #[test]
    fn select_tenant_skips_tenants_at_ceiling() {
        let storage = MemoryStorage::new();
        storage.enqueue_item(&item("t", "a", 1), 0, 0).unwrap();
        storage.set_limit("t", Some(1)).unwrap();
        storage.acquire_token("t", "tok", 4).unwrap();
        assert_eq!(storage.select_tenant(0, 10, 100, 4).unwrap(), None);
        storage.release_token("t", "tok").unwrap();
        assert_eq!(storage.select_tenant(0, 10, 100, 4).unwrap().as_deref(), Some("t"));
    }

    #[test]
    fn select_tenant_rotates_among_backlogged_tenants() {
        let storage = MemoryStorage::new();
        for i in 0..3 {
            storage.enqueue_item(&item("a", &format!("a-{i}"), i), 0, 0).unwrap();
            storage.enqueue_item(&item("b", &format!("b-{i}"), i), 0, 0).unwrap();
        }
        let picks: Vec<_> = (0..4)
            .map(|_| storage.select_tenant(0, 10, 100, 4).unwrap().unwrap())
            .collect();
        assert_eq!(picks, ["a", "b", "a", "b"]);
    }

    #[test]
    fn refund_credit_restores_a_debited_credit() {
        let storage = MemoryStorage::new();
        storage.enqueue_item(&item("t", "a", 1), 0, 0).unwrap();
        storage.enqueue_item(&item("t", "b", 2), 0, 0).unwrap();
        assert_eq!(storage.select_tenant(0, 10, 100, 4).unwrap().as_deref(), Some("t"));
        assert_eq!(storage.deficit("t").unwrap(), 9);
        storage.refund_credit("t").unwrap();
        assert_eq!(storage.deficit("t").unwrap(), 10);
    }

    #[test]
    fn deficit_is_capped() {
        let storage = MemoryStorage::new();
        storage.enqueue_item(&item("t", "a", 1), 0, 0).unwrap();
        storage.set_limit("t", Some(0)).unwrap(); // never eligible
        for _ in 0..50 {
            assert_eq!(storage.select_tenant(0, 10, 25, 4).unwrap(), None);
        }
        assert_eq!(storage.deficit("t").unwrap(), 25);
    }
}
