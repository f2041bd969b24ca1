//! Recovery of work lost with a dead pool and of records stuck in a
//! non-final status.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use jobservice_kv::{Batch, KeyBuilder, KvStore};
use jobservice_opm::JobStatsManager;
use jobservice_protocols::utils::now_epoch;
use jobservice_protocols::{JobServiceResult, Status};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pool::{PoolStats, PoolStatus};
use crate::queue::BackendQueue;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Wait before the first pass after start.
    pub initial_delay: Duration,

    /// Period of requeueing the in-progress jobs of dead pools.
    pub dead_pool_interval: Duration,

    /// Period of the outdated stats pass.
    pub outdated_stats_interval: Duration,

    /// A running record not updated for this long is failed.
    pub max_update_age: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            dead_pool_interval: Duration::from_secs(60),
            outdated_stats_interval: Duration::from_secs(60 * 60),
            max_update_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

pub struct Reaper {
    kv: Arc<dyn KvStore>,
    keys: KeyBuilder,
    queue: Arc<BackendQueue>,
    stats: Arc<JobStatsManager>,
    pool_id: String,
    job_names: Vec<String>,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(
        kv: Arc<dyn KvStore>,
        keys: KeyBuilder,
        queue: Arc<BackendQueue>,
        stats: Arc<JobStatsManager>,
        pool_id: impl Into<String>,
        job_names: Vec<String>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            kv,
            keys,
            queue,
            stats,
            pool_id: pool_id.into(),
            job_names,
            config,
        }
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.initial_delay) => {}
            }

            let mut dead_pools = tokio::time::interval(self.config.dead_pool_interval);
            let mut outdated = tokio::time::interval(self.config.outdated_stats_interval);
            info!("Reaper started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = dead_pools.tick() => {
                        if let Err(e) = self.reap_dead_pools(now_epoch()).await {
                            warn!("Reaping dead pools failed: {}", e);
                        }
                    }
                    _ = outdated.tick() => {
                        if let Err(e) = self.sync_outdated_stats(now_epoch()).await {
                            warn!("Syncing outdated stats failed: {}", e);
                        }
                    }
                }
            }
            info!("Reaper stopped");
        })
    }

    /// Requeue the in-progress jobs of every other pool whose heartbeat is
    /// dead, then forget that pool. Returns the number of requeued jobs.
    pub async fn reap_dead_pools(&self, now: i64) -> JobServiceResult<usize> {
        let mut moved = 0;
        for (pool_id, _) in self.kv.zrange_with_scores(&self.keys.worker_pools()).await? {
            if pool_id == self.pool_id {
                continue;
            }
            let hash = self.kv.hget_all(&self.keys.worker_pool(&pool_id)).await?;
            let pool = PoolStats::from_hash(&pool_id, &hash, now);
            if pool.status != PoolStatus::Dead {
                continue;
            }

            let names: Vec<String> = pool
                .job_names
                .into_iter()
                .chain(self.job_names.iter().cloned())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let requeued = self.queue.requeue_in_progress(&pool_id, &names).await?;
            let batch = Batch::new()
                .zrem(self.keys.worker_pools(), pool_id.clone())
                .del(self.keys.worker_pool(&pool_id));
            self.kv.exec(batch).await?;

            info!(pool_id = %pool_id, "Reaped dead pool, {} jobs requeued", requeued);
            moved += requeued;
        }
        Ok(moved)
    }

    /// Fail tracked jobs whose record has not changed for `max_update_age`
    /// and drop tracking entries of finished or vanished jobs. Returns the
    /// number of failed jobs.
    pub async fn sync_outdated_stats(&self, now: i64) -> JobServiceResult<usize> {
        let max_age = self.config.max_update_age.as_secs() as i64;
        let mut failed = 0;
        for (job_id, _) in self.queue.tracked().await? {
            let stats = match self.stats.retrieve(&job_id).await {
                Ok(stats) => stats,
                Err(e) if e.is_not_found() => {
                    debug!(job_id = %job_id, "Untracking job without stats");
                    self.queue.untrack(&job_id).await?;
                    continue;
                }
                Err(e) => {
                    warn!(job_id = %job_id, "Failed to read tracked job: {}", e);
                    continue;
                }
            };

            if stats.status.is_final() {
                self.queue.untrack(&job_id).await?;
            } else if stats.update_time + max_age < now {
                self.stats.set_job_status(&job_id, Status::Error).await;
                self.queue.untrack(&job_id).await?;
                info!(job_id = %job_id, "Job not updated since {}, marked as error", stats.update_time);
                failed += 1;
            }
        }
        Ok(failed)
    }
}

#[cfg(test)]
#[path = "reaper_tests.rs"]
mod tests;
