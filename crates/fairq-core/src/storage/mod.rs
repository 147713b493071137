pub(crate) mod keys;
mod memory;
mod redis;
mod traits;

pub use self::memory::MemoryStorage;
pub use self::redis::RedisStorage;
pub use traits::{EnqueueStatus, ExpiredClaim, MasterEntry, Storage};
