pub mod completion;
pub mod concurrency;
pub mod config;
pub mod consumer;
pub mod drr;
pub mod engine;
pub mod error;
pub mod item;
pub mod reclaim;
pub mod storage;
pub mod telemetry;
pub mod visibility;

pub use config::FairQueueConfig;
pub use consumer::{ConsumerPool, Handler, HandlerOutcome};
pub use engine::{FairQueue, TenantStats};
pub use error::{CompleteError, EnqueueError, OpsError, SpawnError, StorageError, StorageResult};
pub use item::{ClaimHandle, CompletionStatus, Delivery, Item};
pub use reclaim::ReclaimLoop;
pub use storage::{MasterEntry, MemoryStorage, RedisStorage, Storage};
