use serde::{Deserialize, Serialize};

/// Core work item domain type. The queue stores routing metadata only;
/// `payload_ref` points at externally stored payload data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Tenant the item belongs to. Fairness and concurrency are scoped to it.
    pub tenant_id: String,
    /// Caller-supplied id, unique per tenant. Doubles as the idempotency key.
    pub item_id: String,
    /// Opaque pointer to the externally stored payload.
    pub payload_ref: String,
    /// Enqueue wall-clock time in epoch milliseconds. Scores the tenant queue.
    pub enqueued_at: u64,
    /// Delivery attempt counter: 0 on first delivery, incremented on reclaim.
    pub attempt: u32,
}

/// Handle identifying one in-flight claim. Returned alongside the item from
/// `claim` and consumed by `complete_message` / `drop_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimHandle {
    pub tenant_id: String,
    pub item_id: String,
    pub consumer_id: String,
}

/// A claimed item together with its handle.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub item: Item,
    pub handle: ClaimHandle,
}

impl Delivery {
    pub fn tenant_id(&self) -> &str {
        &self.handle.tenant_id
    }

    pub fn item_id(&self) -> &str {
        &self.handle.item_id
    }
}

/// Outcome of recording a completion for an item id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// First completion record for this item id.
    FirstTime,
    /// A record already existed: the item was redelivered after its effects
    /// were applied. Callers must not re-apply side effects.
    AlreadySeen,
}
