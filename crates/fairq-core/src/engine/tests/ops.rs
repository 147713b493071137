use super::*;

#[test]
fn tenant_stats_reflect_queue_state() {
    let (_storage, engine) = test_engine();
    engine.enqueue("acme", "a", "ref").unwrap();
    engine.enqueue("acme", "b", "ref").unwrap();
    claim_one(&engine, "c1");

    let stats = engine.tenant_stats("acme").unwrap();
    assert_eq!(stats.tenant_id, "acme");
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.in_flight, 1);
    assert_eq!(stats.limit, engine.config().limits.default_concurrency);
}

#[test]
fn stats_for_unknown_tenant_are_zeroed() {
    let (_storage, engine) = test_engine();
    let stats = engine.tenant_stats("ghost").unwrap();
    assert_eq!((stats.pending, stats.in_flight, stats.deficit), (0, 0, 0));
}

#[test]
fn stale_entries_surface_drained_tenants() {
    let (_storage, engine) = test_engine();
    engine.enqueue("acme", "a", "ref").unwrap();
    let delivery = claim_one(&engine, "c1");
    engine.complete(&delivery.handle).unwrap();

    // The queue is drained but the master entry lingers until the next
    // scheduling pass visits it.
    let stale = engine.stale_entries(0).unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].tenant_id, "acme");
    assert_eq!(stale[0].pending, 0);

    // A pass over the shard cleans it up.
    assert!(engine.claim("c1").unwrap().is_none());
    assert!(engine.stale_entries(0).unwrap().is_empty());
}

#[test]
fn backlogged_tenant_is_not_listed_as_stale() {
    let (_storage, engine) = test_engine();
    engine.enqueue("acme", "a", "ref").unwrap();
    assert!(engine.stale_entries(0).unwrap().is_empty());
}

#[test]
fn force_release_of_unknown_token_is_a_noop() {
    let (_storage, engine) = test_engine();
    assert!(!engine.force_release_token("acme", "nope").unwrap());
}

#[test]
fn concurrency_limit_override_round_trips() {
    let (_storage, engine) = test_engine();
    engine.set_concurrency_limit("acme", Some(7)).unwrap();
    assert_eq!(engine.tenant_stats("acme").unwrap().limit, 7);
    engine.set_concurrency_limit("acme", None).unwrap();
    assert_eq!(
        engine.tenant_stats("acme").unwrap().limit,
        engine.config().limits.default_concurrency
    );
}
