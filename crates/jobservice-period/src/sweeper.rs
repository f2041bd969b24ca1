//! Removes delayed entries that fell out of the enqueue horizon.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobservice_kv::{KeyBuilder, KvStore};
use jobservice_opm::JobStatsManager;
use jobservice_protocols::{JobServiceError, JobServiceResult, QueuedJob, Status};
use tracing::{debug, info, warn};

use crate::enqueuer::ENQUEUE_HORIZON_SECS;
use crate::lock::PeriodicLock;

pub struct Sweeper {
    kv: Arc<dyn KvStore>,
    keys: KeyBuilder,
    stats: Arc<JobStatsManager>,
}

impl Sweeper {
    pub fn new(kv: Arc<dyn KvStore>, keys: KeyBuilder, stats: Arc<JobStatsManager>) -> Self {
        Self { kv, keys, stats }
    }

    /// Delete every delayed entry scheduled at or before `now - horizon`.
    /// One-off jobs removed this way are marked `Error`; periodic firings
    /// are simply dropped.
    ///
    /// Every failure is collected into one error; the periodic lock is always
    /// released. Returns how many entries were removed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> JobServiceResult<usize> {
        let Some(lock) = PeriodicLock::try_acquire(&self.kv, &self.keys).await? else {
            return Err(JobServiceError::Internal(
                "periodic lock is held by another replica".to_string(),
            ));
        };

        let mut errors = Vec::new();
        let removed = self.sweep_locked(now, &mut errors).await;

        if let Err(e) = lock.release().await {
            errors.push(format!("release lock: {}", e));
        }

        if errors.is_empty() {
            if removed > 0 {
                info!("Swept {} outdated delayed entries", removed);
            }
            Ok(removed)
        } else {
            Err(JobServiceError::Internal(format!(
                "sweep finished with {} error(s): {}",
                errors.len(),
                errors.join("; ")
            )))
        }
    }

    async fn sweep_locked(&self, now: DateTime<Utc>, errors: &mut Vec<String>) -> usize {
        let scheduled = self.keys.scheduled();
        let stale = match self
            .kv
            .zrange_by_score(&scheduled, 0, now.timestamp() - ENQUEUE_HORIZON_SECS)
            .await
        {
            Ok(stale) => stale,
            Err(e) => {
                errors.push(format!("read delayed queue: {}", e));
                return 0;
            }
        };

        let mut removed = 0;
        for (raw, score) in stale {
            match self.kv.zrem(&scheduled, &raw).await {
                Ok(true) => removed += 1,
                Ok(false) => {
                    debug!("Entry at {} already gone", score);
                    continue;
                }
                Err(e) => {
                    errors.push(format!("remove entry at {}: {}", score, e));
                    continue;
                }
            }

            match QueuedJob::decode(&raw) {
                Ok(job) if job.periodic => {}
                Ok(job) => {
                    warn!(job_id = %job.id, "Delayed job {} missed its run at {}", job.name, score);
                    self.stats.set_job_status(&job.id, Status::Error).await;
                }
                Err(e) => warn!("Undecodable delayed queue entry at {}: {}", score, e),
            }
        }
        removed
    }
}
