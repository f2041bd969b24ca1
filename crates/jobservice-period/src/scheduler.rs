//! Persistence of periodic policies.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobservice_kv::{Batch, KeyBuilder, KvStore};
use jobservice_opm::JobStatsManager;
use jobservice_protocols::utils::{make_identifier, now_epoch};
use jobservice_protocols::{
    BusEvent, JobServiceError, JobServiceResult, OpCommand, Policy, QueuedJob,
};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::enqueuer::Enqueuer;
use crate::policy_store::PolicyStore;

/// Attempts at drawing an unused numeric policy id.
const NUMERIC_ID_ATTEMPTS: usize = 10;
/// Numeric ids are the assignment epoch plus a random offset below this.
const NUMERIC_ID_OFFSET: i64 = 1000;

/// Owns every mutation of the persistent policy set.
///
/// The set stores each policy serialized without its ids, scored by its
/// numeric id. A second sorted set maps the policy id to that score.
pub struct Scheduler {
    kv: Arc<dyn KvStore>,
    keys: KeyBuilder,
    policies: Arc<PolicyStore>,
    stats: Arc<JobStatsManager>,
    enqueuer: Arc<Enqueuer>,
}

impl Scheduler {
    pub fn new(
        kv: Arc<dyn KvStore>,
        keys: KeyBuilder,
        policies: Arc<PolicyStore>,
        stats: Arc<JobStatsManager>,
        enqueuer: Arc<Enqueuer>,
    ) -> Self {
        Self {
            kv,
            keys,
            policies,
            stats,
            enqueuer,
        }
    }

    /// Persist `policy`, announce it to every replica and seed its first
    /// enqueue round.
    ///
    /// A policy with the same job, parameters, cron and hook is rejected with
    /// a conflict naming the existing policy id. Returns the policy id and the
    /// next firing.
    pub async fn schedule(
        &self,
        policy: Policy,
    ) -> JobServiceResult<(String, Option<DateTime<Utc>>)> {
        self.schedule_at(policy, Utc::now()).await
    }

    pub(crate) async fn schedule_at(
        &self,
        mut policy: Policy,
        now: DateTime<Utc>,
    ) -> JobServiceResult<(String, Option<DateTime<Utc>>)> {
        if policy.id.is_empty() {
            policy.id = make_identifier();
        }
        policy.validate()?;

        let member = policy.serialize_for_set()?;
        if let Some(score) = self.kv.zscore(&self.keys.period_policies(), &member).await? {
            let existing = self.policy_id_by_score(score).await?.unwrap_or_default();
            return Err(JobServiceError::conflict(
                format!("periodic job '{}' with the same schedule exists", policy.job_name),
                existing,
            ));
        }

        policy.numeric_id = self.unused_numeric_id().await?;
        let event = BusEvent::Schedule(policy.clone());
        let batch = Batch::new()
            .zadd(self.keys.period_policies(), member, policy.numeric_id)
            .zadd(self.keys.period_key_score(), policy.id.clone(), policy.numeric_id)
            .publish(self.keys.notifications(), event.encode()?);
        self.kv.exec(batch).await?;

        self.policies.add(policy.clone());
        if let Err(e) = self.enqueuer.enqueue_policy(&policy, now).await {
            // The next regular round picks the policy up.
            warn!(policy_id = %policy.id, "Failed to seed first enqueue round: {}", e);
        }

        let next_run = policy.next_run(now)?;
        info!(
            policy_id = %policy.id,
            numeric_id = policy.numeric_id,
            "Scheduled periodic job {} ({})",
            policy.job_name,
            policy.cron_spec
        );
        Ok((policy.id, next_run))
    }

    /// Remove a policy and clean up what it left behind.
    ///
    /// The removal itself is atomic; stopping running executions, deleting
    /// materialized firings and expiring the stats record are best effort.
    pub async fn unschedule(&self, policy_id: &str) -> JobServiceResult<()> {
        self.unschedule_at(policy_id, Utc::now()).await
    }

    pub(crate) async fn unschedule_at(
        &self,
        policy_id: &str,
        now: DateTime<Utc>,
    ) -> JobServiceResult<()> {
        if policy_id.is_empty() {
            return Err(JobServiceError::Validation("empty policy id".to_string()));
        }

        let Some(score) = self
            .kv
            .zscore(&self.keys.period_key_score(), policy_id)
            .await?
        else {
            return Err(JobServiceError::NotFound(format!(
                "periodic policy '{}'",
                policy_id
            )));
        };

        let mut policy = match self.policy_by_score(score).await? {
            Some(policy) => policy,
            None => {
                warn!(policy_id = %policy_id, "Policy body missing at score {}", score);
                Policy::new(policy_id, "", Default::default(), "")
            }
        };
        policy.id = policy_id.to_string();
        policy.numeric_id = score;

        let event = BusEvent::UnSchedule(policy);
        let batch = Batch::new()
            .zrem_range_by_score(self.keys.period_policies(), score, score)
            .zrem(self.keys.period_key_score(), policy_id)
            .publish(self.keys.notifications(), event.encode()?);
        self.kv.exec(batch).await?;
        self.policies.remove(policy_id);
        info!(policy_id = %policy_id, "Unscheduled periodic job");

        if let Err(e) = self.stats.send_command(policy_id, OpCommand::Stop, false).await {
            warn!(policy_id = %policy_id, "Failed to stop running executions: {}", e);
        }
        match self.remove_firings(policy_id, now).await {
            Ok(n) => debug!(policy_id = %policy_id, "Removed {} pending firings", n),
            Err(e) => warn!(policy_id = %policy_id, "Failed to remove pending firings: {}", e),
        }
        if let Err(e) = self.stats.expire_periodic_job_stats(policy_id).await {
            warn!(policy_id = %policy_id, "Failed to expire stats record: {}", e);
        }
        Ok(())
    }

    /// Rebuild the local policy cache from the persistent set.
    pub async fn load(&self) -> JobServiceResult<usize> {
        let ids: HashMap<i64, String> = self
            .kv
            .zrange_with_scores(&self.keys.period_key_score())
            .await?
            .into_iter()
            .map(|(id, score)| (score, id))
            .collect();

        let mut loaded = 0;
        for (raw, score) in self.kv.zrange_with_scores(&self.keys.period_policies()).await? {
            let mut policy = match Policy::deserialize(&raw) {
                Ok(policy) => policy,
                Err(e) => {
                    warn!("Skip undecodable policy at {}: {}", score, e);
                    continue;
                }
            };
            let Some(id) = ids.get(&score) else {
                warn!("Skip policy at {}: no id mapped to its score", score);
                continue;
            };
            policy.id = id.clone();
            policy.numeric_id = score;
            if self.policies.add(policy) {
                loaded += 1;
            }
        }

        info!("Loaded {} periodic policies", loaded);
        Ok(loaded)
    }

    async fn remove_firings(&self, policy_id: &str, now: DateTime<Utc>) -> JobServiceResult<usize> {
        let horizon = self.enqueuer.horizon().num_seconds();
        let scheduled = self.keys.scheduled();
        let entries = self
            .kv
            .zrange_by_score(&scheduled, now.timestamp() - horizon, now.timestamp() + horizon)
            .await?;

        let mut removed = 0;
        for (raw, _) in entries {
            let Ok(job) = QueuedJob::decode(&raw) else {
                continue;
            };
            if job.periodic && job.id == policy_id && self.kv.zrem(&scheduled, &raw).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn unused_numeric_id(&self) -> JobServiceResult<i64> {
        for _ in 0..NUMERIC_ID_ATTEMPTS {
            let candidate = now_epoch() + rand::thread_rng().gen_range(0..NUMERIC_ID_OFFSET);
            let taken = self
                .kv
                .zrange_by_score(&self.keys.period_policies(), candidate, candidate)
                .await?;
            if taken.is_empty() {
                return Ok(candidate);
            }
        }
        Err(JobServiceError::Internal(
            "no free numeric policy id".to_string(),
        ))
    }

    async fn policy_id_by_score(&self, score: i64) -> JobServiceResult<Option<String>> {
        Ok(self
            .kv
            .zrange_by_score(&self.keys.period_key_score(), score, score)
            .await?
            .into_iter()
            .next()
            .map(|(id, _)| id))
    }

    async fn policy_by_score(&self, score: i64) -> JobServiceResult<Option<Policy>> {
        match self
            .kv
            .zrange_by_score(&self.keys.period_policies(), score, score)
            .await?
            .into_iter()
            .next()
        {
            Some((raw, _)) => Ok(Some(Policy::deserialize(&raw)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
