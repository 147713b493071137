use std::sync::{Mutex, MutexGuard};

use redis::{Connection, Script};

use crate::error::{StorageError, StorageResult};
use crate::item::Item;
use crate::storage::keys;
use crate::storage::traits::{EnqueueStatus, ExpiredClaim, MasterEntry, Storage};

/// Admission: reject duplicate ids (live record or completion marker), enforce
/// the pending ceiling, then create the record, queue entry, and master-index
/// entry in one step.
///
/// KEYS: item, queue, done, shard, seq. ARGV: tenant, item_id, payload_ref,
/// enqueued_at, max_pending.
const ENQUEUE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 or redis.call('EXISTS', KEYS[3]) == 1 then
    return 'dup'
end
local pending = redis.call('ZCARD', KEYS[2])
local ceiling = tonumber(ARGV[5])
if ceiling > 0 and pending >= ceiling then
    return 'full:' .. pending
end
redis.call('HSET', KEYS[1], 'payload_ref', ARGV[3], 'enqueued_at', ARGV[4], 'attempt', 0)
redis.call('ZADD', KEYS[2], tonumber(ARGV[4]), ARGV[2])
if redis.call('ZSCORE', KEYS[4], ARGV[1]) == false then
    local seq = redis.call('INCR', KEYS[5])
    redis.call('ZADD', KEYS[4], seq, ARGV[1])
end
return 'ok'
"#;

/// One DRR pass over a shard, starting at the shard's rotation cursor: credit
/// quantum (capped), drop drained tenants, return the first eligible tenant
/// after debiting one credit and advancing the cursor past it. Per-tenant
/// queue and token keys are derived inside the script, which assumes a
/// non-clustered Redis.
///
/// KEYS: shard, deficit hash, limits hash, cursors hash. ARGV: quantum,
/// max_deficit, default_limit, key prefix, shard id.
const SELECT_TENANT: &str = r#"
local tenants = redis.call('ZRANGE', KEYS[1], 0, -1)
local n = #tenants
if n == 0 then
    return false
end
local start = tonumber(redis.call('HGET', KEYS[4], ARGV[5]) or '0') % n
for i = 0, n - 1 do
    local pos = (start + i) % n
    local tenant = tenants[pos + 1]
    if redis.call('ZCARD', ARGV[4] .. 'q:' .. tenant) == 0 then
        redis.call('HDEL', KEYS[2], tenant)
        redis.call('ZREM', KEYS[1], tenant)
    else
        local deficit = tonumber(redis.call('HGET', KEYS[2], tenant) or '0') + tonumber(ARGV[1])
        local cap = tonumber(ARGV[2])
        if deficit > cap then
            deficit = cap
        end
        local limit = tonumber(redis.call('HGET', KEYS[3], tenant) or ARGV[3])
        local held = redis.call('SCARD', ARGV[4] .. 'tokens:' .. tenant)
        if deficit >= 1 and held < limit then
            redis.call('HSET', KEYS[2], tenant, deficit - 1)
            redis.call('HSET', KEYS[4], ARGV[5], pos + 1)
            return tenant
        end
        redis.call('HSET', KEYS[2], tenant, deficit)
    end
end
return false
"#;

/// Conditional token grant under the tenant's effective limit.
///
/// KEYS: tokens set, limits hash. ARGV: tenant, token, default_limit.
const ACQUIRE_TOKEN: &str = r#"
local limit = tonumber(redis.call('HGET', KEYS[2], ARGV[1]) or ARGV[3])
if redis.call('SCARD', KEYS[1]) >= limit then
    return 0
end
redis.call('SADD', KEYS[1], ARGV[2])
return 1
"#;

/// Pop the head of a tenant queue and record the claim plus its expiry index
/// entry, returning the item fields. The claim key depends on the popped id,
/// so it is derived from the prefix inside the script.
///
/// KEYS: queue, expiry index. ARGV: tenant, consumer, token, expiry_ms,
/// key prefix, member separator.
const POP_AND_TRACK: &str = r#"
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
    return false
end
local item_id = popped[1]
redis.call('HSET', ARGV[5] .. 'claim:' .. ARGV[1] .. ':' .. item_id,
    'consumer', ARGV[2], 'token', ARGV[3], 'expiry', ARGV[4])
redis.call('ZADD', KEYS[2], tonumber(ARGV[4]), ARGV[1] .. ARGV[6] .. item_id)
local fields = redis.call('HMGET', ARGV[5] .. 'item:' .. ARGV[1] .. ':' .. item_id,
    'payload_ref', 'enqueued_at', 'attempt')
if not fields[1] then
    return {'!corrupt', item_id}
end
return {'ok', item_id, fields[1], fields[2], fields[3]}
"#;

/// Heartbeat: move a live claim's expiry forward in both the claim hash and
/// the expiry index.
///
/// KEYS: claim, expiry index. ARGV: member, new expiry_ms.
const EXTEND_CLAIM: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
redis.call('HSET', KEYS[1], 'expiry', ARGV[2])
redis.call('ZADD', KEYS[2], 'XX', tonumber(ARGV[2]), ARGV[1])
return 1
"#;

/// Terminal release: delete claim, expiry entry, and item record, and free the
/// claim's recorded token, all in one step.
///
/// KEYS: claim, expiry index, item, tokens set. ARGV: member.
const RELEASE_CLAIM: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
local token = redis.call('HGET', KEYS[1], 'token')
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('DEL', KEYS[3])
if token then
    redis.call('SREM', KEYS[4], token)
end
return 1
"#;

/// Recovery: return an expired claim to its queue tail, bump the attempt
/// counter, re-ensure the master-index entry, and free the token.
///
/// KEYS: claim, expiry index, item, queue, shard, seq, tokens set.
/// ARGV: member, now_ms, force, tenant, item_id.
const RECLAIM_CLAIM: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
if ARGV[3] == '0' then
    local expiry = tonumber(redis.call('HGET', KEYS[1], 'expiry') or '0')
    if expiry > tonumber(ARGV[2]) then
        return 0
    end
end
local token = redis.call('HGET', KEYS[1], 'token')
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HINCRBY', KEYS[3], 'attempt', 1)
redis.call('ZADD', KEYS[4], tonumber(ARGV[2]), ARGV[5])
if redis.call('ZSCORE', KEYS[5], ARGV[4]) == false then
    local seq = redis.call('INCR', KEYS[6])
    redis.call('ZADD', KEYS[5], seq, ARGV[4])
end
if token then
    redis.call('SREM', KEYS[7], token)
end
return 1
"#;

struct Scripts {
    enqueue: Script,
    select_tenant: Script,
    acquire_token: Script,
    pop_and_track: Script,
    extend_claim: Script,
    release_claim: Script,
    reclaim_claim: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE),
            select_tenant: Script::new(SELECT_TENANT),
            acquire_token: Script::new(ACQUIRE_TOKEN),
            pop_and_track: Script::new(POP_AND_TRACK),
            extend_claim: Script::new(EXTEND_CLAIM),
            release_claim: Script::new(RELEASE_CLAIM),
            reclaim_claim: Script::new(RECLAIM_CLAIM),
        }
    }
}

/// Redis-backed storage. Every multi-key mutation runs as one server-side
/// script, so each `Storage` method is atomic on the wire. Targets a single
/// (non-clustered) Redis instance: the DRR and claim scripts derive key names
/// at runtime.
pub struct RedisStorage {
    conn: Mutex<Connection>,
    scripts: Scripts,
}

impl RedisStorage {
    /// Connect to the Redis instance at `url` (e.g. `redis://127.0.0.1:6379`).
    pub fn connect(url: &str) -> StorageResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection()?;
        Ok(Self {
            conn: Mutex::new(conn),
            scripts: Scripts::load(),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Storage for RedisStorage {
    fn enqueue_item(
        &self,
        item: &Item,
        shard: u32,
        max_pending: u64,
    ) -> StorageResult<EnqueueStatus> {
        let mut conn = self.conn();
        let reply: String = self
            .scripts
            .enqueue
            .key(keys::item_key(&item.tenant_id, &item.item_id))
            .key(keys::queue_key(&item.tenant_id))
            .key(keys::done_key(&item.tenant_id, &item.item_id))
            .key(keys::shard_key(shard))
            .key(keys::seq_key())
            .arg(&item.tenant_id)
            .arg(&item.item_id)
            .arg(&item.payload_ref)
            .arg(item.enqueued_at)
            .arg(max_pending)
            .invoke(&mut *conn)?;
        match reply.as_str() {
            "ok" => Ok(EnqueueStatus::Accepted),
            "dup" => Ok(EnqueueStatus::DuplicateItemId),
            other => match other.strip_prefix("full:") {
                Some(depth) => Ok(EnqueueStatus::CapacityExceeded {
                    pending: depth.parse().map_err(|_| {
                        StorageError::CorruptData(format!("bad enqueue reply: {other}"))
                    })?,
                }),
                None => Err(StorageError::CorruptData(format!(
                    "bad enqueue reply: {other}"
                ))),
            },
        }
    }

    fn select_tenant(
        &self,
        shard: u32,
        quantum: i64,
        max_deficit: i64,
        default_limit: u64,
    ) -> StorageResult<Option<String>> {
        let mut conn = self.conn();
        let tenant: Option<String> = self
            .scripts
            .select_tenant
            .key(keys::shard_key(shard))
            .key(keys::deficit_key())
            .key(keys::limits_key())
            .key(keys::cursors_key())
            .arg(quantum)
            .arg(max_deficit)
            .arg(default_limit)
            .arg(keys::PREFIX)
            .arg(shard)
            .invoke(&mut *conn)?;
        Ok(tenant)
    }

    fn refund_credit(&self, tenant: &str) -> StorageResult<()> {
        let mut conn = self.conn();
        redis::cmd("HINCRBY")
            .arg(keys::deficit_key())
            .arg(tenant)
            .arg(1)
            .query::<()>(&mut *conn)?;
        Ok(())
    }

    fn acquire_token(
        &self,
        tenant: &str,
        token: &str,
        default_limit: u64,
    ) -> StorageResult<bool> {
        let mut conn = self.conn();
        let granted: i64 = self
            .scripts
            .acquire_token
            .key(keys::tokens_key(tenant))
            .key(keys::limits_key())
            .arg(tenant)
            .arg(token)
            .arg(default_limit)
            .invoke(&mut *conn)?;
        Ok(granted == 1)
    }

    fn release_token(&self, tenant: &str, token: &str) -> StorageResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("SREM")
            .arg(keys::tokens_key(tenant))
            .arg(token)
            .query(&mut *conn)?;
        Ok(removed == 1)
    }

    fn token_count(&self, tenant: &str) -> StorageResult<u64> {
        let mut conn = self.conn();
        let count: u64 = redis::cmd("SCARD")
            .arg(keys::tokens_key(tenant))
            .query(&mut *conn)?;
        Ok(count)
    }

    fn set_limit(&self, tenant: &str, limit: Option<u64>) -> StorageResult<()> {
        let mut conn = self.conn();
        match limit {
            Some(limit) => redis::cmd("HSET")
                .arg(keys::limits_key())
                .arg(tenant)
                .arg(limit)
                .query::<()>(&mut *conn)?,
            None => redis::cmd("HDEL")
                .arg(keys::limits_key())
                .arg(tenant)
                .query::<()>(&mut *conn)?,
        }
        Ok(())
    }

    fn limit(&self, tenant: &str) -> StorageResult<Option<u64>> {
        let mut conn = self.conn();
        let limit: Option<u64> = redis::cmd("HGET")
            .arg(keys::limits_key())
            .arg(tenant)
            .query(&mut *conn)?;
        Ok(limit)
    }

    fn pop_and_track(
        &self,
        tenant: &str,
        consumer_id: &str,
        token: &str,
        expiry_ms: u64,
    ) -> StorageResult<Option<Item>> {
        let mut conn = self.conn();
        let reply: Option<Vec<String>> = self
            .scripts
            .pop_and_track
            .key(keys::queue_key(tenant))
            .key(keys::expiry_key())
            .arg(tenant)
            .arg(consumer_id)
            .arg(token)
            .arg(expiry_ms)
            .arg(keys::PREFIX)
            .arg(keys::MEMBER_SEP.to_string())
            .invoke(&mut *conn)?;
        let Some(fields) = reply else {
            return Ok(None);
        };
        match fields.first().map(String::as_str) {
            Some("ok") if fields.len() == 5 => Ok(Some(Item {
                tenant_id: tenant.to_string(),
                item_id: fields[1].clone(),
                payload_ref: fields[2].clone(),
                enqueued_at: fields[3].parse().map_err(|_| {
                    StorageError::CorruptData(format!("bad enqueued_at for {}", fields[1]))
                })?,
                attempt: fields[4].parse().map_err(|_| {
                    StorageError::CorruptData(format!("bad attempt for {}", fields[1]))
                })?,
            })),
            Some("!corrupt") => Err(StorageError::CorruptData(format!(
                "queued item {} has no record",
                fields.get(1).map(String::as_str).unwrap_or("?")
            ))),
            _ => Err(StorageError::CorruptData(
                "bad pop reply shape".to_string(),
            )),
        }
    }

    fn extend_claim(
        &self,
        tenant: &str,
        item_id: &str,
        new_expiry_ms: u64,
    ) -> StorageResult<bool> {
        let mut conn = self.conn();
        let extended: i64 = self
            .scripts
            .extend_claim
            .key(keys::claim_key(tenant, item_id))
            .key(keys::expiry_key())
            .arg(keys::expiry_member(tenant, item_id))
            .arg(new_expiry_ms)
            .invoke(&mut *conn)?;
        Ok(extended == 1)
    }

    fn release_claim(&self, tenant: &str, item_id: &str) -> StorageResult<bool> {
        let mut conn = self.conn();
        let released: i64 = self
            .scripts
            .release_claim
            .key(keys::claim_key(tenant, item_id))
            .key(keys::expiry_key())
            .key(keys::item_key(tenant, item_id))
            .key(keys::tokens_key(tenant))
            .arg(keys::expiry_member(tenant, item_id))
            .invoke(&mut *conn)?;
        Ok(released == 1)
    }

    fn list_expired(&self, now_ms: u64, limit: usize) -> StorageResult<Vec<ExpiredClaim>> {
        let mut conn = self.conn();
        let entries: Vec<(String, u64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(keys::expiry_key())
            .arg("-inf")
            .arg(now_ms)
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query(&mut *conn)?;
        let mut expired = Vec::with_capacity(entries.len());
        for (member, score) in entries {
            let (tenant_id, item_id) = keys::parse_expiry_member(&member).ok_or_else(|| {
                StorageError::CorruptData(format!("bad expiry index member: {member:?}"))
            })?;
            let consumer_id: Option<String> = redis::cmd("HGET")
                .arg(keys::claim_key(&tenant_id, &item_id))
                .arg("consumer")
                .query(&mut *conn)?;
            expired.push(ExpiredClaim {
                tenant_id,
                item_id,
                // Claim hash can vanish between the scan and this read.
                consumer_id: consumer_id.unwrap_or_default(),
                expired_at: score,
            });
        }
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
        let mut conn = self.conn();
        let reclaimed: i64 = self
            .scripts
            .reclaim_claim
            .key(keys::claim_key(tenant, item_id))
            .key(keys::expiry_key())
            .key(keys::item_key(tenant, item_id))
            .key(keys::queue_key(tenant))
            .key(keys::shard_key(shard))
            .key(keys::seq_key())
            .key(keys::tokens_key(tenant))
            .arg(keys::expiry_member(tenant, item_id))
            .arg(now_ms)
            .arg(i32::from(force))
            .arg(tenant)
            .arg(item_id)
            .invoke(&mut *conn)?;
        Ok(reclaimed == 1)
    }

    fn find_claim(&self, item_id: &str) -> StorageResult<Option<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = redis::cmd("ZRANGE")
            .arg(keys::expiry_key())
            .arg(0)
            .arg(-1)
            .query(&mut *conn)?;
        for member in members {
            if let Some((tenant, item)) = keys::parse_expiry_member(&member) {
                if item == item_id {
                    return Ok(Some(tenant));
                }
            }
        }
        Ok(None)
    }

    fn mark_if_new(
        &self,
        tenant: &str,
        item_id: &str,
        retention_ms: u64,
    ) -> StorageResult<bool> {
        let mut conn = self.conn();
        // Redis rejects PX 0. A zero window lapses immediately, so record
        // nothing and report first-time against any live marker.
        if retention_ms == 0 {
            let exists: i64 = redis::cmd("EXISTS")
                .arg(keys::done_key(tenant, item_id))
                .query(&mut *conn)?;
            return Ok(exists == 0);
        }
        // SET NX PX is already a single conditional write.
        let reply: Option<String> = redis::cmd("SET")
            .arg(keys::done_key(tenant, item_id))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(retention_ms)
            .query(&mut *conn)?;
        Ok(reply.is_some())
    }

    fn is_completed(&self, tenant: &str, item_id: &str) -> StorageResult<bool> {
        let mut conn = self.conn();
        let exists: i64 = redis::cmd("EXISTS")
            .arg(keys::done_key(tenant, item_id))
            .query(&mut *conn)?;
        Ok(exists == 1)
    }

    fn pending_count(&self, tenant: &str) -> StorageResult<u64> {
        let mut conn = self.conn();
        let count: u64 = redis::cmd("ZCARD")
            .arg(keys::queue_key(tenant))
            .query(&mut *conn)?;
        Ok(count)
    }

    fn deficit(&self, tenant: &str) -> StorageResult<i64> {
        let mut conn = self.conn();
        let deficit: Option<i64> = redis::cmd("HGET")
            .arg(keys::deficit_key())
            .arg(tenant)
            .query(&mut *conn)?;
        Ok(deficit.unwrap_or(0))
    }

    fn shard_entries(&self, shard: u32) -> StorageResult<Vec<MasterEntry>> {
        let mut conn = self.conn();
        let tenants: Vec<String> = redis::cmd("ZRANGE")
            .arg(keys::shard_key(shard))
            .arg(0)
            .arg(-1)
            .query(&mut *conn)?;
        let mut entries = Vec::with_capacity(tenants.len());
        for tenant in tenants {
            let pending: u64 = redis::cmd("ZCARD")
                .arg(keys::queue_key(&tenant))
                .query(&mut *conn)?;
            let deficit: Option<i64> = redis::cmd("HGET")
                .arg(keys::deficit_key())
                .arg(&tenant)
                .query(&mut *conn)?;
            let tokens: u64 = redis::cmd("SCARD")
                .arg(keys::tokens_key(&tenant))
                .query(&mut *conn)?;
            entries.push(MasterEntry {
                tenant_id: tenant,
                pending,
                deficit: deficit.unwrap_or(0),
                tokens,
            });
        }
        Ok(entries)
    }
}
