//! Job queues kept in the KV store.
//!
//! - `jobs:<name>`: list of ready jobs per handler, `LPUSH` in and
//!   `RPOPLPUSH` out into the taking pool's `jobs:<name>:<pool>:inprogress`
//!   list, where the entry stays until the job finishes
//! - `scheduled`: delayed jobs scored by run epoch
//! - `retry`: failed jobs scored by next attempt epoch
//! - `dead`: exhausted jobs scored by death epoch
//! - `job_track:inprogress`: hash of running job ids

use std::collections::HashMap;
use std::sync::Arc;

use jobservice_kv::{KeyBuilder, KvStore};
use jobservice_protocols::{JobServiceResult, QueuedJob};
use rand::Rng;
use tracing::{debug, error, warn};

/// Seconds until the next attempt of a job that failed `fails` times.
pub fn retry_backoff_secs(fails: u64) -> i64 {
    let fails = fails.min(1_000) as i64;
    let jitter = rand::thread_rng().gen_range(0..30i64);
    fails.pow(4) + 15 + jitter * (fails + 1)
}

/// A job taken off its ready queue, parked in the taking pool's in-progress
/// list until [`BackendQueue::ack`].
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: QueuedJob,
    raw: String,
    in_progress: String,
}

pub struct BackendQueue {
    kv: Arc<dyn KvStore>,
    keys: KeyBuilder,
}

impl BackendQueue {
    pub fn new(kv: Arc<dyn KvStore>, keys: KeyBuilder) -> Self {
        Self { kv, keys }
    }

    /// Push a job onto its ready queue.
    pub async fn enqueue(&self, job: &QueuedJob) -> JobServiceResult<()> {
        self.kv.lpush(&self.keys.jobs(&job.name), &job.encode()?).await?;
        Ok(())
    }

    /// Park a job in the delayed queue until `run_at`.
    pub async fn schedule(&self, job: &QueuedJob, run_at: i64) -> JobServiceResult<()> {
        self.kv
            .zadd(&self.keys.scheduled(), &job.encode()?, run_at)
            .await?;
        Ok(())
    }

    pub async fn retry_at(&self, job: &QueuedJob, at: i64) -> JobServiceResult<()> {
        self.kv.zadd(&self.keys.retry(), &job.encode()?, at).await?;
        Ok(())
    }

    pub async fn bury(&self, job: &QueuedJob, died_at: i64) -> JobServiceResult<()> {
        self.kv.zadd(&self.keys.dead(), &job.encode()?, died_at).await?;
        Ok(())
    }

    /// Take the next ready job for pool `pool_id`, trying `names` in order.
    pub async fn dequeue(&self, names: &[String], pool_id: &str) -> JobServiceResult<Option<ClaimedJob>> {
        for name in names {
            let in_progress = self.keys.in_progress(name, pool_id);
            let Some(raw) = self.kv.rpoplpush(&self.keys.jobs(name), &in_progress).await? else {
                continue;
            };
            match QueuedJob::decode(&raw) {
                Ok(job) => {
                    return Ok(Some(ClaimedJob {
                        job,
                        raw,
                        in_progress,
                    }));
                }
                Err(e) => {
                    warn!("Dropping undecodable job from queue {}: {}", name, e);
                    self.kv.lrem(&in_progress, &raw).await?;
                }
            }
        }
        Ok(None)
    }

    /// Drop a finished job from its pool's in-progress list.
    pub async fn ack(&self, claimed: &ClaimedJob) -> JobServiceResult<()> {
        self.kv.lrem(&claimed.in_progress, &claimed.raw).await?;
        Ok(())
    }

    /// Push every job left in pool `pool_id`'s in-progress lists back onto
    /// its ready queue.
    pub async fn requeue_in_progress(&self, pool_id: &str, names: &[String]) -> JobServiceResult<usize> {
        let mut moved = 0;
        for name in names {
            let in_progress = self.keys.in_progress(name, pool_id);
            let ready = self.keys.jobs(name);
            while self.kv.rpoplpush(&in_progress, &ready).await?.is_some() {
                moved += 1;
            }
        }
        Ok(moved)
    }

    pub async fn in_progress_len(&self, name: &str, pool_id: &str) -> JobServiceResult<u64> {
        Ok(self.kv.llen(&self.keys.in_progress(name, pool_id)).await?)
    }

    /// Record that job `job_id` started running at `at`.
    pub async fn track(&self, job_id: &str, at: i64) -> JobServiceResult<()> {
        let fields = vec![(job_id.to_string(), at.to_string())];
        self.kv
            .hset_multiple(&self.keys.in_progress_tracker(), &fields)
            .await?;
        Ok(())
    }

    pub async fn untrack(&self, job_id: &str) -> JobServiceResult<bool> {
        Ok(self.kv.hdel(&self.keys.in_progress_tracker(), job_id).await?)
    }

    /// Ids of every running job in the namespace with their start epoch.
    pub async fn tracked(&self) -> JobServiceResult<HashMap<String, i64>> {
        let hash = self.kv.hget_all(&self.keys.in_progress_tracker()).await?;
        Ok(hash
            .into_iter()
            .map(|(id, at)| {
                let at = at.parse().unwrap_or_default();
                (id, at)
            })
            .collect())
    }

    pub async fn ready_len(&self, name: &str) -> JobServiceResult<u64> {
        Ok(self.kv.llen(&self.keys.jobs(name)).await?)
    }

    /// Move every delayed and retry entry due at `now` to its ready queue.
    ///
    /// Only the replica whose `ZREM` removed an entry pushes it, so a due
    /// entry is moved once however many replicas race for it. An entry whose
    /// push fails is put back with its score.
    pub async fn requeue_due(&self, now: i64) -> JobServiceResult<usize> {
        let mut moved = 0;
        for set in [self.keys.scheduled(), self.keys.retry()] {
            for (raw, score) in self.kv.zrange_by_score(&set, i64::MIN, now).await? {
                if !self.kv.zrem(&set, &raw).await? {
                    continue;
                }
                let job = match QueuedJob::decode(&raw) {
                    Ok(job) => job,
                    Err(e) => {
                        warn!("Dropping undecodable entry of {}: {}", set, e);
                        continue;
                    }
                };
                if let Err(e) = self.kv.lpush(&self.keys.jobs(&job.name), &raw).await {
                    if let Err(undo) = self.kv.zadd(&set, &raw, score).await {
                        error!(job_id = %job.id, "Lost due job of {}: {}", set, undo);
                    }
                    return Err(e.into());
                }
                moved += 1;
            }
        }
        if moved > 0 {
            debug!("Requeued {} due jobs", moved);
        }
        Ok(moved)
    }

    /// Delete the delayed entry of job `id` scored exactly `run_at`.
    pub async fn delete_scheduled_job(&self, run_at: i64, id: &str) -> JobServiceResult<bool> {
        let set = self.keys.scheduled();
        Ok(self.take(&set, run_at, id).await?.is_some())
    }

    /// Move the dead entry of job `id` scored exactly `die_at` back to its
    /// ready queue with a clean fail record.
    pub async fn retry_dead_job(&self, die_at: i64, id: &str) -> JobServiceResult<bool> {
        let set = self.keys.dead();
        let Some(mut job) = self.take(&set, die_at, id).await? else {
            return Ok(false);
        };
        job.fails = 0;
        job.err = None;
        job.failed_at = 0;
        self.enqueue(&job).await?;
        Ok(true)
    }

    async fn take(&self, set: &str, score: i64, id: &str) -> JobServiceResult<Option<QueuedJob>> {
        for (raw, _) in self.kv.zrange_by_score(set, score, score).await? {
            let Ok(job) = QueuedJob::decode(&raw) else {
                continue;
            };
            if job.id == id && self.kv.zrem(set, &raw).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
