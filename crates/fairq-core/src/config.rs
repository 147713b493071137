use serde::Deserialize;
use tracing::warn;

/// Top-level queue configuration, deserializable from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FairQueueConfig {
    pub scheduler: SchedulerConfig,
    pub visibility: VisibilityConfig,
    pub consumer: ConsumerConfig,
    pub limits: LimitsConfig,
}

/// DRR scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of master index shards. Tenants route to a shard by hash, so
    /// changing this on a live deployment strands existing entries.
    pub shard_count: u32,
    /// Deficit credited to each tenant with pending work per pass.
    pub quantum: i64,
    /// Deficit accumulation cap. Bounds the burst an idle-then-busy tenant
    /// can claim in one pass.
    pub max_deficit: i64,
}

/// Visibility timeout and reclaim loop configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VisibilityConfig {
    /// How long a claim stays invisible before the reclaim loop may take it
    /// back. Must exceed worst-case handler time or items re-deliver while
    /// still being processed.
    pub timeout_ms: u64,
    /// Base reclaim scan interval.
    pub reclaim_interval_ms: u64,
    /// Expired claims processed per reclaim scan.
    pub reclaim_batch: usize,
    /// Consecutive empty scans before the interval starts doubling.
    pub reclaim_cooloff_after: u32,
    /// Ceiling for the cooled-off scan interval.
    pub reclaim_cooloff_max_interval_ms: u64,
}

/// Consumer pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub consumer_count: usize,
    /// Sleep between claim attempts when no work is available.
    pub poll_interval_ms: u64,
    /// Ceiling for the storage-error backoff (doubles from poll_interval_ms).
    pub error_backoff_max_ms: u64,
}

/// Per-tenant ceilings and retention.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Concurrency ceiling for tenants without an override.
    pub default_concurrency: u64,
    /// Pending-queue ceiling per tenant. Zero disables the cap.
    pub max_pending_per_tenant: u64,
    /// How long completion markers are retained. Redelivery of an item
    /// completed longer ago than this re-applies its effects.
    pub idempotency_retention_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            shard_count: 8,
            quantum: 10,
            max_deficit: 100,
        }
    }
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            reclaim_interval_ms: 1_000,
            reclaim_batch: 128,
            reclaim_cooloff_after: 10,
            reclaim_cooloff_max_interval_ms: 30_000,
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_count: 4,
            poll_interval_ms: 100,
            error_backoff_max_ms: 5_000,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 4,
            max_pending_per_tenant: 100_000,
            idempotency_retention_ms: 24 * 60 * 60 * 1000,
        }
    }
}

impl FairQueueConfig {
    /// Parse a TOML document. Missing sections and fields take defaults.
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        let config: Self = toml::from_str(input)?;
        config.warn_on_risky_values();
        Ok(config)
    }

    /// A limit of 1 means a single stuck claim blocks the whole tenant until
    /// the visibility timeout fires. Legal, but worth a warning.
    fn warn_on_risky_values(&self) {
        if self.limits.default_concurrency <= 1 {
            warn!(
                default_concurrency = self.limits.default_concurrency,
                "default concurrency of 1 serializes every tenant; a crashed \
                 consumer stalls its tenant for the full visibility timeout"
            );
        }
        if self.visibility.timeout_ms < self.consumer.poll_interval_ms {
            warn!(
                timeout_ms = self.visibility.timeout_ms,
                poll_interval_ms = self.consumer.poll_interval_ms,
                "visibility timeout shorter than the poll interval; claims \
                 may expire before handlers run"
            );
        }
    }
}
