//! Best-effort distributed lock shared by the enqueuer and the sweeper.

use std::sync::Arc;

use jobservice_kv::{KeyBuilder, KvStore, SetOptions};
use jobservice_protocols::JobServiceResult;
use jobservice_protocols::utils::make_identifier;
use tracing::debug;

pub const LOCK_TTL_SECS: u64 = 30;

/// Holder of the `period:lock` key. The lock expires on its own after
/// [`LOCK_TTL_SECS`] if never released.
pub struct PeriodicLock {
    kv: Arc<dyn KvStore>,
    key: String,
    token: String,
}

impl PeriodicLock {
    /// `Ok(None)` when another holder owns the lock.
    pub async fn try_acquire(
        kv: &Arc<dyn KvStore>,
        keys: &KeyBuilder,
    ) -> JobServiceResult<Option<Self>> {
        let key = keys.period_lock();
        let token = make_identifier();
        let acquired = kv
            .set(&key, &token, SetOptions::nx_ex(LOCK_TTL_SECS))
            .await?;
        if !acquired {
            debug!("Periodic lock {} is held elsewhere", key);
            return Ok(None);
        }
        Ok(Some(Self {
            kv: Arc::clone(kv),
            key,
            token,
        }))
    }

    /// Release unless the lock expired and was taken by someone else.
    pub async fn release(self) -> JobServiceResult<bool> {
        Ok(self.kv.del_if_eq(&self.key, &self.token).await?)
    }
}
