//! Materializes policy firings into the delayed queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use jobservice_kv::{Batch, KeyBuilder, KvStore, SetOptions};
use jobservice_opm::JobStatsManager;
use jobservice_protocols::policy::firings_within;
use jobservice_protocols::{JobServiceResult, Policy, QueuedJob, Status};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::lock::PeriodicLock;
use crate::policy_store::PolicyStore;

/// Minimum spacing of two enqueue rounds across all replicas.
pub const ENQUEUE_INTERVAL_SECS: i64 = 120;
/// Lookahead materialized by one round. Must exceed the interval so a
/// missed round after a failover is still covered.
pub const ENQUEUE_HORIZON_SECS: i64 = 4 * 60;

#[derive(Debug, Clone)]
pub struct EnqueuerConfig {
    pub interval: Duration,
    /// Upper bound of the random extra sleep between rounds.
    pub max_jitter: Duration,
    pub horizon_secs: i64,
}

impl Default for EnqueuerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(ENQUEUE_INTERVAL_SECS as u64),
            max_jitter: Duration::from_secs(30),
            horizon_secs: ENQUEUE_HORIZON_SECS,
        }
    }
}

pub struct Enqueuer {
    kv: Arc<dyn KvStore>,
    keys: KeyBuilder,
    policies: Arc<PolicyStore>,
    stats: Arc<JobStatsManager>,
    config: EnqueuerConfig,
}

impl Enqueuer {
    pub fn new(
        kv: Arc<dyn KvStore>,
        keys: KeyBuilder,
        policies: Arc<PolicyStore>,
        stats: Arc<JobStatsManager>,
        config: EnqueuerConfig,
    ) -> Self {
        Self {
            kv,
            keys,
            policies,
            stats,
            config,
        }
    }

    pub fn horizon(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.horizon_secs)
    }

    /// Run one round now, then one every interval plus jitter, until `cancel`.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let enqueuer = Arc::clone(self);
        tokio::spawn(async move {
            info!("Periodic enqueuer started");
            loop {
                if let Err(e) = enqueuer.enqueue(Utc::now()).await {
                    error!("Periodic enqueue failed: {}", e);
                }

                let jitter_ms = enqueuer.config.max_jitter.as_millis() as u64;
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(enqueuer.config.interval + jitter) => {}
                }
            }
            info!("Periodic enqueuer stopped");
        });
    }

    /// One enqueue round at `now`.
    ///
    /// Skipped when another replica enqueued within the last interval or holds
    /// the periodic lock. Returns the number of firings written.
    pub async fn enqueue(&self, now: DateTime<Utc>) -> JobServiceResult<usize> {
        if !self.is_due(now).await? {
            debug!("Periodic enqueue skipped: last round is recent");
            return Ok(0);
        }

        let Some(lock) = PeriodicLock::try_acquire(&self.kv, &self.keys).await? else {
            debug!("Periodic enqueue skipped: lock is held by another replica");
            return Ok(0);
        };

        let result = self.enqueue_locked(now).await;
        if let Err(e) = lock.release().await {
            warn!("Failed to release periodic lock: {}", e);
        }
        result
    }

    async fn enqueue_locked(&self, now: DateTime<Utc>) -> JobServiceResult<usize> {
        // Another replica may have finished a round while we waited for the lock.
        if !self.is_due(now).await? {
            return Ok(0);
        }

        let count = self.materialize(now).await?;
        self.kv
            .set(
                &self.keys.last_periodic_enqueue(),
                &now.timestamp().to_string(),
                SetOptions::default(),
            )
            .await?;
        info!("Periodic enqueue round done: {} firings", count);
        Ok(count)
    }

    async fn is_due(&self, now: DateTime<Utc>) -> JobServiceResult<bool> {
        let last = self
            .kv
            .get(&self.keys.last_periodic_enqueue())
            .await?
            .and_then(|v| v.parse::<i64>().ok());
        Ok(match last {
            Some(last) => now.timestamp() - last >= ENQUEUE_INTERVAL_SECS,
            None => true,
        })
    }

    /// Write the firings of every cached policy within the horizon, bypassing
    /// the interval check and the lock. Idempotent for a given `now`.
    pub async fn materialize(&self, now: DateTime<Utc>) -> JobServiceResult<usize> {
        let mut count = 0;
        for policy in self.policies.list() {
            match self.enqueue_policy(&policy, now).await {
                Ok(n) => count += n,
                // One broken policy must not starve the others.
                Err(e) => error!(policy_id = %policy.id, "Failed to enqueue policy: {}", e),
            }
        }
        Ok(count)
    }

    /// Write the firings of one policy within the horizon from `now`.
    pub async fn enqueue_policy(&self, policy: &Policy, now: DateTime<Utc>) -> JobServiceResult<usize> {
        let schedule = policy.schedule()?;
        // Firings land on whole seconds.
        let from = Utc
            .timestamp_opt(now.timestamp(), 0)
            .single()
            .unwrap_or(now);
        let firings = firings_within(&schedule, from, self.horizon());

        let scheduled = self.keys.scheduled();
        let mut batch = Batch::new();
        for at in &firings {
            let job = QueuedJob::periodic_trigger(
                &policy.id,
                &policy.job_name,
                policy.job_params.clone(),
                at.timestamp(),
            );
            batch = batch.zadd(scheduled.clone(), job.encode()?, at.timestamp());
        }

        if !batch.is_empty() {
            self.kv.exec(batch).await?;
        }
        self.stats.set_job_status(&policy.id, Status::Scheduled).await;

        debug!(
            policy_id = %policy.id,
            "Enqueued {} firings of {}",
            firings.len(),
            policy.job_name
        );
        Ok(firings.len())
    }
}

#[cfg(test)]
#[path = "enqueuer_tests.rs"]
mod tests;
