use super::*;

#[test]
fn first_completion_is_first_time() {
    let (_storage, engine) = test_engine();
    engine.enqueue("acme", "a", "ref").unwrap();
    let delivery = claim_one(&engine, "c1");
    assert_eq!(
        engine.complete(&delivery.handle).unwrap(),
        CompletionStatus::FirstTime
    );
    assert!(engine.is_complete("acme", "a").unwrap());
    let stats = engine.tenant_stats("acme").unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.in_flight, 0);
}

#[test]
fn completing_a_released_claim_fails() {
    let (_storage, engine) = test_engine();
    engine.enqueue("acme", "a", "ref").unwrap();
    let delivery = claim_one(&engine, "c1");
    engine.complete(&delivery.handle).unwrap();

    let err = engine.complete(&delivery.handle).unwrap_err();
    assert!(matches!(err, CompleteError::ClaimNotFound { .. }));
}

#[test]
fn completion_frees_the_slot_in_the_same_step() {
    // With a limit of 1, any gap between marker write and token release
    // would make this claim fail.
    let (_storage, engine) = test_engine_with(test_config_with_limit(1));
    engine.enqueue("acme", "a", "ref").unwrap();
    engine.enqueue("acme", "b", "ref").unwrap();

    let first = claim_one(&engine, "c1");
    engine.complete(&first.handle).unwrap();
    let second = claim_one(&engine, "c1");
    assert_eq!(second.item_id(), "b");
}

#[test]
fn late_completion_after_reclaim_records_the_marker() {
    let (_storage, engine) = test_engine();
    engine.enqueue("acme", "a", "ref").unwrap();
    let stalled = claim_one(&engine, "c1");
    engine.force_reclaim("a").unwrap();

    // The stalled consumer finishes after its claim was taken back. The
    // completion errors, but the marker is recorded first.
    let err = engine.complete(&stalled.handle).unwrap_err();
    assert!(matches!(err, CompleteError::ClaimNotFound { .. }));
    assert!(engine.is_complete("acme", "a").unwrap());

    // The requeued copy is delivered once more; the second consumer sees the
    // marker and completes without re-applying effects.
    let redelivered = claim_one(&engine, "c2");
    assert_eq!(redelivered.item.attempt, 1);
    assert!(engine.is_complete("acme", "a").unwrap());
    assert_eq!(
        engine.complete(&redelivered.handle).unwrap(),
        CompletionStatus::AlreadySeen
    );
    assert_eq!(engine.tenant_stats("acme").unwrap().in_flight, 0);
}

#[test]
fn drop_leaves_no_marker() {
    let (_storage, engine) = test_engine();
    engine.enqueue("acme", "a", "ref").unwrap();
    let delivery = claim_one(&engine, "c1");
    engine.drop_item(&delivery.handle, "unparseable").unwrap();
    assert!(!engine.is_complete("acme", "a").unwrap());
    assert_eq!(engine.tenant_stats("acme").unwrap().in_flight, 0);

    let err = engine.drop_item(&delivery.handle, "again").unwrap_err();
    assert!(matches!(err, CompleteError::ClaimNotFound { .. }));
}
