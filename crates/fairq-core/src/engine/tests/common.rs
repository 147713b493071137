use super::*;

pub(super) fn test_engine() -> (Arc<MemoryStorage>, FairQueue) {
    test_engine_with(test_config())
}

pub(super) fn test_engine_with(config: FairQueueConfig) -> (Arc<MemoryStorage>, FairQueue) {
    let storage = Arc::new(MemoryStorage::new());
    let engine = FairQueue::new(Arc::clone(&storage) as Arc<dyn Storage>, config);
    (storage, engine)
}

/// Single shard keeps tenant ordering deterministic across tests.
pub(super) fn test_config() -> FairQueueConfig {
    let mut config = FairQueueConfig::default();
    config.scheduler.shard_count = 1;
    config
}

pub(super) fn test_config_with_limit(default_concurrency: u64) -> FairQueueConfig {
    let mut config = test_config();
    config.limits.default_concurrency = default_concurrency;
    config
}

/// Claim and unwrap, failing the test when no work is claimable.
pub(super) fn claim_one(engine: &FairQueue, consumer: &str) -> Delivery {
    engine
        .claim(consumer)
        .unwrap()
        .unwrap_or_else(|| panic!("expected claimable work for {consumer}"))
}
