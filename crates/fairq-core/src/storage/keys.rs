//! Key naming for the Redis-resident structures.
//!
//! All keys share the `fq:` prefix. Composite members of the in-flight index
//! join tenant and item id with the unit separator (0x1F), which is disallowed
//! in both identifiers.

pub const PREFIX: &str = "fq:";

/// Separator inside in-flight index members: `{tenant}\x1f{item}`.
pub const MEMBER_SEP: char = '\u{1f}';

/// Item record hash: `fq:item:{tenant}:{item}`.
pub fn item_key(tenant: &str, item_id: &str) -> String {
    format!("{PREFIX}item:{tenant}:{item_id}")
}

/// Per-tenant pending queue (zset scored by enqueue time): `fq:q:{tenant}`.
pub fn queue_key(tenant: &str) -> String {
    format!("{PREFIX}q:{tenant}")
}

/// Master index shard (zset scored by insertion sequence): `fq:shard:{n}`.
pub fn shard_key(shard: u32) -> String {
    format!("{PREFIX}shard:{shard}")
}

/// Global insertion counter feeding shard index scores.
pub fn seq_key() -> String {
    format!("{PREFIX}seq")
}

/// DRR deficit counters, one hash field per tenant.
pub fn deficit_key() -> String {
    format!("{PREFIX}deficit")
}

/// Outstanding concurrency tokens: `fq:tokens:{tenant}`.
pub fn tokens_key(tenant: &str) -> String {
    format!("{PREFIX}tokens:{tenant}")
}

/// Per-shard DRR rotation cursors, one hash field per shard.
pub fn cursors_key() -> String {
    format!("{PREFIX}cursors")
}

/// Per-tenant concurrency limit overrides, one hash field per tenant.
pub fn limits_key() -> String {
    format!("{PREFIX}limits")
}

/// In-flight expiry index (zset scored by claim expiry ms).
pub fn expiry_key() -> String {
    format!("{PREFIX}expiry")
}

/// Claim metadata hash: `fq:claim:{tenant}:{item}`.
pub fn claim_key(tenant: &str, item_id: &str) -> String {
    format!("{PREFIX}claim:{tenant}:{item_id}")
}

/// Completion marker (string with retention TTL): `fq:done:{tenant}:{item}`.
pub fn done_key(tenant: &str, item_id: &str) -> String {
    format!("{PREFIX}done:{tenant}:{item_id}")
}

/// Member of the in-flight expiry index.
pub fn expiry_member(tenant: &str, item_id: &str) -> String {
    format!("{tenant}{MEMBER_SEP}{item_id}")
}

/// Split an expiry index member back into (tenant, item id).
pub fn parse_expiry_member(member: &str) -> Option<(String, String)> {
    let (tenant, item_id) = member.split_once(MEMBER_SEP)?;
    if tenant.is_empty() || item_id.is_empty() {
        return None;
    }
    Some((tenant.to_string(), item_id.to_string()))
}

/// Deterministic tenant → shard routing (FNV-1a over the tenant id). A tenant
/// always lands in the same shard, so a stale entry in another shard can never
/// mask live work.
pub fn shard_of(tenant: &str, shard_count: u32) -> u32 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for byte in tenant.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash % u64::from(shard_count.max(1))) as u32
}
