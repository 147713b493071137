use std::sync::Arc;

use uuid::Uuid;

use crate::error::StorageResult;
use crate::storage::Storage;

/// Per-tenant concurrency token accounting.
///
/// Tokens are opaque UUIDs held in a per-tenant set. The grant is conditional
/// on the set being below the tenant's effective limit and runs as one atomic
/// storage operation, so two racing acquirers cannot both land the last slot.
/// Release is idempotent: the completion and reclaim paths can race over the
/// same token without double-freeing.
pub struct ConcurrencyManager {
    storage: Arc<dyn Storage>,
    default_limit: u64,
}

impl ConcurrencyManager {
    pub fn new(storage: Arc<dyn Storage>, default_limit: u64) -> Self {
        Self {
            storage,
            default_limit,
        }
    }

    /// Try to acquire one token for the tenant. Returns the token id, or None
    /// when the tenant is at its ceiling (Denied).
    pub fn try_acquire(&self, tenant: &str) -> StorageResult<Option<String>> {
        let token = Uuid::new_v4().to_string();
        if self
            .storage
            .acquire_token(tenant, &token, self.default_limit)?
        {
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    /// Return a token. False means it was already gone, which is fine.
    pub fn release(&self, tenant: &str, token: &str) -> StorageResult<bool> {
        self.storage.release_token(tenant, token)
    }

    /// Outstanding tokens for a tenant.
    pub fn count(&self, tenant: &str) -> StorageResult<u64> {
        self.storage.token_count(tenant)
    }

    /// Set or clear a per-tenant limit override. Lowering a limit below the
    /// current token count does not revoke tokens; the tenant just gets no
    /// new grants until it drains below the new ceiling.
    pub fn set_limit(&self, tenant: &str, limit: Option<u64>) -> StorageResult<()> {
        self.storage.set_limit(tenant, limit)
    }

    /// The tenant's effective limit (override or the configured default).
    pub fn effective_limit(&self, tenant: &str) -> StorageResult<u64> {
        Ok(self.storage.limit(tenant)?.unwrap_or(self.default_limit))
    }
}
