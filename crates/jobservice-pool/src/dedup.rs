//! Uniqueness lock of (job name, parameters).

use std::sync::Arc;

use jobservice_kv::{KeyBuilder, KvStore, SetOptions, params_digest};
use jobservice_protocols::{JobServiceError, JobServiceResult, Parameters};
use tracing::debug;

/// Lifetime of a uniqueness lock whose owner never released it.
pub const UNIQUE_LOCK_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Clone)]
pub struct DeDuplicator {
    kv: Arc<dyn KvStore>,
    keys: KeyBuilder,
}

impl DeDuplicator {
    pub fn new(kv: Arc<dyn KvStore>, keys: KeyBuilder) -> Self {
        Self { kv, keys }
    }

    /// Take the lock of `(job_name, params)`.
    ///
    /// Fails with a conflict while another live instance holds it.
    pub async fn must_unique(&self, job_name: &str, params: &Parameters) -> JobServiceResult<()> {
        let key = self.keys.unique_running(job_name, &params_digest(params));
        let acquired = self
            .kv
            .set(&key, "1", SetOptions::nx_ex(UNIQUE_LOCK_TTL_SECS))
            .await?;
        if !acquired {
            return Err(JobServiceError::conflict(
                format!("unique job '{}' with the same parameters is running", job_name),
                "",
            ));
        }
        Ok(())
    }

    pub async fn del_unique_sign(&self, job_name: &str, params: &Parameters) -> JobServiceResult<()> {
        let key = self.keys.unique_running(job_name, &params_digest(params));
        if self.kv.del(&key).await? {
            debug!("Released uniqueness lock of {}", job_name);
        }
        Ok(())
    }
}
