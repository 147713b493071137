//! Exercises the Redis backend against a live instance.
//!
//! Opt-in: point `REDIS_URL` at a disposable Redis database to run these
//! (the `fq:` namespace is cleared before each test); without it every test
//! returns early. The same scenarios run against the in-memory backend in
//! the unit suites; this file checks the server-side scripts agree with it.

use std::env;
use std::sync::{Arc, Mutex, MutexGuard};

use fairq_core::item::Item;
use fairq_core::reclaim;
use fairq_core::storage::{EnqueueStatus, MemoryStorage, RedisStorage, Storage};
use fairq_core::{CompletionStatus, FairQueue, FairQueueConfig};

// One shared database; tests run one at a time.
static DB: Mutex<()> = Mutex::new(());

fn open() -> Option<(MutexGuard<'static, ()>, Arc<RedisStorage>)> {
    let url = env::var("REDIS_URL").ok()?;
    let guard = DB.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    clear_namespace(&url);
    let storage = RedisStorage::connect(&url).expect("REDIS_URL points at a live Redis");
    Some((guard, Arc::new(storage)))
}

fn clear_namespace(url: &str) {
    let client = redis::Client::open(url).expect("valid REDIS_URL");
    let mut conn = client.get_connection().expect("live Redis");
    let keys: Vec<String> = redis::cmd("KEYS")
        .arg("fq:*")
        .query(&mut conn)
        .expect("KEYS fq:*");
    if !keys.is_empty() {
        redis::cmd("DEL").arg(keys).query::<()>(&mut conn).expect("DEL");
    }
}

fn engine_over(storage: Arc<RedisStorage>, timeout_ms: u64) -> FairQueue {
    let mut config = FairQueueConfig::default();
    config.scheduler.shard_count = 1;
    config.visibility.timeout_ms = timeout_ms;
    FairQueue::new(storage as Arc<dyn Storage>, config)
}

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
fn full_cycle_enqueue_claim_complete() {
    let Some((_db, storage)) = open() else { return };
    let engine = engine_over(storage, 30_000);

    engine.enqueue("acme", "a", "ref/a").unwrap();
    let delivery = engine.claim("c1").unwrap().expect("claimable work");
    assert_eq!(delivery.item.payload_ref, "ref/a");
    assert_eq!(engine.tenant_stats("acme").unwrap().in_flight, 1);

    assert_eq!(
        engine.complete(&delivery.handle).unwrap(),
        CompletionStatus::FirstTime
    );
    let stats = engine.tenant_stats("acme").unwrap();
    assert_eq!((stats.pending, stats.in_flight), (0, 0));
    // The marker occupies the id for the retention window.
    assert!(engine.enqueue("acme", "a", "ref/a").is_err());
}

#[test]
fn expired_claim_is_requeued_with_a_bumped_attempt() {
    let Some((_db, storage)) = open() else { return };
    let engine = engine_over(storage, 0);

    engine.enqueue("acme", "a", "ref/a").unwrap();
    engine.claim("c1").unwrap().expect("claimable work");

    // Timeout of zero: the claim expires at claim time.
    assert_eq!(reclaim::scan_once(&engine, 16).unwrap(), 1);
    let stats = engine.tenant_stats("acme").unwrap();
    assert_eq!((stats.pending, stats.in_flight), (1, 0));

    let redelivered = engine.claim("c1").unwrap().expect("redelivery");
    assert_eq!(redelivered.item.attempt, 1);
}

#[test]
fn drr_rotation_matches_the_memory_backend() {
    let Some((_db, redis_storage)) = open() else { return };
    let memory = MemoryStorage::new();
    let backends: [&dyn Storage; 2] = [&*redis_storage, &memory];

    for backend in backends {
        for i in 0..3 {
            backend
                .enqueue_item(&item("a", &format!("a-{i}"), i), 0, 0)
                .unwrap();
            backend
                .enqueue_item(&item("b", &format!("b-{i}"), i), 0, 0)
                .unwrap();
        }
        let picks: Vec<String> = (0..4)
            .map(|_| {
                backend
                    .select_tenant(0, 10, 100, 4)
                    .unwrap()
                    .expect("backlogged tenant")
            })
            .collect();
        assert_eq!(picks, ["a", "b", "a", "b"]);
    }
}

#[test]
fn release_claim_frees_the_token_and_record() {
    let Some((_db, storage)) = open() else { return };

    storage.enqueue_item(&item("t", "a", 1), 0, 0).unwrap();
    assert!(storage.acquire_token("t", "tok", 4).unwrap());
    storage
        .pop_and_track("t", "c1", "tok", 100)
        .unwrap()
        .expect("queued item");

    assert!(storage.release_claim("t", "a").unwrap());
    assert_eq!(storage.token_count("t").unwrap(), 0);
    assert!(!storage.release_claim("t", "a").unwrap());
    // Record gone, no marker: the id is free again.
    assert_eq!(
        storage.enqueue_item(&item("t", "a", 2), 0, 0).unwrap(),
        EnqueueStatus::Accepted
    );
}

#[test]
fn tokens_mirror_outstanding_claims() {
    let Some((_db, storage)) = open() else { return };
    let engine = engine_over(storage, 30_000);

    for tenant in ["red", "blue"] {
        for i in 0..3 {
            engine
                .enqueue(tenant, &format!("{tenant}-{i}"), "ref")
                .unwrap();
        }
    }
    let mut held = Vec::new();
    while let Some(delivery) = engine.claim("c1").unwrap() {
        held.push(delivery);
    }
    assert_eq!(held.len(), 6);

    let red: Vec<_> = held.iter().filter(|d| d.tenant_id() == "red").collect();
    engine.complete(&red[0].handle).unwrap();
    engine.drop_item(&red[1].handle, "poison payload").unwrap();

    assert_eq!(engine.tenant_stats("red").unwrap().in_flight, 1);
    assert_eq!(engine.tenant_stats("blue").unwrap().in_flight, 3);
}

#[test]
fn refund_credit_restores_a_debited_credit() {
    let Some((_db, storage)) = open() else { return };

    storage.enqueue_item(&item("t", "a", 1), 0, 0).unwrap();
    storage.enqueue_item(&item("t", "b", 2), 0, 0).unwrap();
    assert_eq!(
        storage.select_tenant(0, 10, 100, 4).unwrap().as_deref(),
        Some("t")
    );
    assert_eq!(storage.deficit("t").unwrap(), 9);
    storage.refund_credit("t").unwrap();
    assert_eq!(storage.deficit("t").unwrap(), 10);
}

#[test]
fn zero_retention_markers_lapse_immediately() {
    let Some((_db, storage)) = open() else { return };

    assert!(storage.mark_if_new("t", "a", 0).unwrap());
    assert!(!storage.is_completed("t", "a").unwrap());
    assert!(storage.mark_if_new("t", "a", 0).unwrap());
}
