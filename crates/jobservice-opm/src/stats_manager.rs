//! Single-writer manager of job statistics.
//!
//! Every write to a `job_stats:<id>` hash goes through one bounded queue
//! drained by one task, so writes for a job land in submission order. A
//! failed write is re-queued after a backoff and dropped after
//! [`StatsManagerConfig::max_attempts`] tries. Hook delivery runs detached
//! from the queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use jobservice_kv::{Batch, KeyBuilder, KvStore};
use jobservice_protocols::stats::{
    FIELD_CHECK_IN, FIELD_CHECK_IN_AT, FIELD_DIE_AT, FIELD_STATUS, FIELD_STATUS_HOOK,
    FIELD_UPDATE_TIME,
};
use jobservice_protocols::utils::{is_valid_url, now_epoch};
use jobservice_protocols::{
    BusEvent, HookData, JobKind, JobServiceError, JobServiceResult, JobStats, OpCommand,
    QueuedJob, Status, StatusChange,
};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::hook_client::{HookClient, HookClientConfig};
use crate::hook_store::HookStore;
use crate::op_commands::OpCommandStore;

const ONE_WEEK_SECS: i64 = 7 * 24 * 60 * 60;
const TTL_JITTER_SECS: i64 = 30;
/// Width of the dead-queue window searched for a job's death score.
const DIE_AT_WINDOW_SECS: i64 = 5;

#[derive(Debug, Clone)]
pub struct StatsManagerConfig {
    pub queue_capacity: usize,
    /// Attempts per write or hook report before it is abandoned.
    pub max_attempts: u32,
    /// Multiplier of the retry backoff; one second in production.
    pub backoff_unit: Duration,
    pub hook_client: HookClientConfig,
}

impl Default for StatsManagerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_attempts: 3,
            backoff_unit: Duration::from_secs(1),
            hook_client: HookClientConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
enum StatsOp {
    Save(JobStats),
    Update {
        job_id: String,
        fields: Vec<(String, String)>,
    },
    SetStatus {
        job_id: String,
        status: Status,
    },
    CheckIn {
        job_id: String,
        message: String,
        at: i64,
    },
    DieAt {
        job_id: String,
        die_at: i64,
    },
    AttachExecutions {
        upstream_id: String,
        executions: Vec<(String, i64)>,
    },
}

impl StatsOp {
    fn name(&self) -> &'static str {
        match self {
            StatsOp::Save(_) => "save",
            StatsOp::Update { .. } => "update",
            StatsOp::SetStatus { .. } => "set_status",
            StatsOp::CheckIn { .. } => "check_in",
            StatsOp::DieAt { .. } => "die_at",
            StatsOp::AttachExecutions { .. } => "attach_executions",
        }
    }

    fn job_id(&self) -> &str {
        match self {
            StatsOp::Save(stats) => &stats.job_id,
            StatsOp::Update { job_id, .. }
            | StatsOp::SetStatus { job_id, .. }
            | StatsOp::CheckIn { job_id, .. }
            | StatsOp::DieAt { job_id, .. } => job_id,
            StatsOp::AttachExecutions { upstream_id, .. } => upstream_id,
        }
    }
}

enum QueueItem {
    Op { op: StatsOp, fails: u32 },
    Barrier(oneshot::Sender<()>),
}

/// Backoff before attempt `fails + 1`: `(fails+1)^fails + rand(0..5)` units.
fn backoff(unit: Duration, fails: u32) -> Duration {
    let base = (fails as u64 + 1).saturating_pow(fails);
    let jitter = rand::thread_rng().gen_range(0..5u64);
    unit.saturating_mul(base.saturating_add(jitter).min(u32::MAX as u64) as u32)
}

/// TTL of a stats record saved at `now`; `None` keeps the record forever.
fn stats_ttl(stats: &JobStats, now: i64) -> Option<i64> {
    let jitter = rand::thread_rng().gen_range(0..TTL_JITTER_SECS);
    match stats.job_kind {
        JobKind::Periodic => None,
        JobKind::Scheduled => Some(ONE_WEEK_SECS + (stats.run_at - now).max(0) + jitter),
        JobKind::Generic => Some(ONE_WEEK_SECS + jitter),
    }
}

/// Owner of job statistics, hook registrations and operator commands.
pub struct JobStatsManager {
    kv: Arc<dyn KvStore>,
    keys: KeyBuilder,
    config: StatsManagerConfig,
    hook_client: HookClient,
    hooks: Arc<HookStore>,
    commands: Arc<OpCommandStore>,
    tx: mpsc::Sender<QueueItem>,
    rx: Mutex<Option<mpsc::Receiver<QueueItem>>>,
    last_execution_score: AtomicI64,
}

impl JobStatsManager {
    pub fn new(
        kv: Arc<dyn KvStore>,
        keys: KeyBuilder,
        config: StatsManagerConfig,
    ) -> JobServiceResult<Arc<Self>> {
        let hook_client = HookClient::new(config.hook_client.clone())?;
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Ok(Arc::new(Self {
            kv,
            keys,
            config,
            hook_client,
            hooks: Arc::new(HookStore::new()),
            commands: Arc::new(OpCommandStore::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            last_execution_score: AtomicI64::new(0),
        }))
    }

    /// Start the write loop and the op command sweeper. Both stop with `cancel`.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JobServiceResult<()> {
        let Some(mut rx) = self.rx.lock().take() else {
            return Err(JobServiceError::Internal(
                "job stats manager is already started".to_string(),
            ));
        };

        self.commands.start_sweeper(cancel.clone());

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            info!("Job stats manager started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = rx.recv() => match item {
                        Some(QueueItem::Op { op, fails }) => manager.handle(op, fails).await,
                        Some(QueueItem::Barrier(done)) => {
                            let _ = done.send(());
                        }
                        None => break,
                    },
                }
            }
            info!("Job stats manager stopped");
        });
        Ok(())
    }

    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    async fn submit(&self, op: StatsOp) {
        let name = op.name();
        if self.tx.send(QueueItem::Op { op, fails: 0 }).await.is_err() {
            warn!("Job stats manager is stopped, dropping {} op", name);
        }
    }

    /// Wait until every write submitted before this call has been applied.
    ///
    /// Writes waiting on a retry backoff are not awaited. Returns at once
    /// when the write loop is not started.
    pub async fn sync(&self) {
        if self.rx.lock().is_some() {
            return;
        }
        let (done, wait) = oneshot::channel();
        if self.tx.send(QueueItem::Barrier(done)).await.is_ok() {
            let _ = wait.await;
        }
    }

    async fn handle(&self, op: StatsOp, fails: u32) {
        let Err(e) = self.process(&op).await else {
            return;
        };

        let fails = fails + 1;
        if fails >= self.config.max_attempts {
            error!(
                job_id = %op.job_id(),
                "Stats op {} abandoned after {} attempts: {}",
                op.name(),
                fails,
                e
            );
            return;
        }

        let delay = backoff(self.config.backoff_unit, fails);
        warn!(
            job_id = %op.job_id(),
            "Stats op {} failed ({}), retrying in {:?}",
            op.name(),
            e,
            delay
        );
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(QueueItem::Op { op, fails }).await;
        });
    }

    async fn process(&self, op: &StatsOp) -> JobServiceResult<()> {
        match op {
            StatsOp::Save(stats) => self.write_stats(stats).await,
            StatsOp::Update { job_id, fields } => {
                let mut fields = fields.clone();
                fields.push((FIELD_UPDATE_TIME.to_string(), now_epoch().to_string()));
                self.kv
                    .hset_multiple(&self.keys.job_stats(job_id), &fields)
                    .await?;
                Ok(())
            }
            StatsOp::SetStatus { job_id, status } => self.write_status(job_id, *status).await,
            StatsOp::CheckIn {
                job_id,
                message,
                at,
            } => {
                let fields = vec![
                    (FIELD_CHECK_IN.to_string(), message.clone()),
                    (FIELD_CHECK_IN_AT.to_string(), at.to_string()),
                    (FIELD_UPDATE_TIME.to_string(), now_epoch().to_string()),
                ];
                self.kv
                    .hset_multiple(&self.keys.job_stats(job_id), &fields)
                    .await?;
                self.report(job_id, Status::Running, Some(message.clone()))
                    .await;
                Ok(())
            }
            StatsOp::DieAt { job_id, die_at } => self.write_die_at(job_id, *die_at).await,
            StatsOp::AttachExecutions {
                upstream_id,
                executions,
            } => {
                let key = self.keys.upstream_job_executions(upstream_id);
                let mut batch = Batch::new();
                for (id, score) in executions {
                    batch = batch.zadd(key.clone(), id.clone(), *score);
                }
                self.kv.exec(batch.expire(key, ONE_WEEK_SECS)).await?;
                Ok(())
            }
        }
    }

    async fn write_stats(&self, stats: &JobStats) -> JobServiceResult<()> {
        let key = self.keys.job_stats(&stats.job_id);
        let mut batch = Batch::new().hset(key.clone(), stats.to_hash_fields());
        if let Some(ttl) = stats_ttl(stats, now_epoch()) {
            batch = batch.expire(key, ttl);
        }
        self.kv.exec(batch).await?;
        Ok(())
    }

    async fn write_status(&self, job_id: &str, status: Status) -> JobServiceResult<()> {
        let key = self.keys.job_stats(job_id);

        // A retried or late write must never move a job backwards.
        if let Some(current) = self.kv.hget(&key, FIELD_STATUS).await? {
            if let Ok(current) = current.parse::<Status>() {
                if !current.can_transition_to(status) {
                    debug!(
                        job_id = %job_id,
                        "Skip status {} -> {}: not a legal transition",
                        current,
                        status
                    );
                    return Ok(());
                }
            }
        }

        let fields = vec![
            (FIELD_STATUS.to_string(), status.to_string()),
            (FIELD_UPDATE_TIME.to_string(), now_epoch().to_string()),
        ];
        self.kv.hset_multiple(&key, &fields).await?;
        self.report(job_id, status, None).await;
        Ok(())
    }

    async fn write_die_at(&self, job_id: &str, die_at: i64) -> JobServiceResult<()> {
        let entries = self
            .kv
            .zrange_by_score(&self.keys.dead(), die_at, die_at + DIE_AT_WINDOW_SECS)
            .await?;

        for (raw, score) in entries {
            let Ok(job) = QueuedJob::decode(&raw) else {
                continue;
            };
            if job.id == job_id {
                let fields = vec![(FIELD_DIE_AT.to_string(), score.to_string())];
                self.kv
                    .hset_multiple(&self.keys.job_stats(job_id), &fields)
                    .await?;
                return Ok(());
            }
        }

        debug!(job_id = %job_id, "No dead queue entry found within [{}, {}]", die_at, die_at + DIE_AT_WINDOW_SECS);
        Ok(())
    }

    /// Post a status change to the job's hook, if one is registered.
    async fn report(&self, job_id: &str, status: Status, check_in: Option<String>) {
        let url = match self.get_hook(job_id).await {
            Ok(url) => url,
            Err(e) if e.is_not_found() => return,
            Err(e) => {
                warn!(job_id = %job_id, "Failed to resolve status hook: {}", e);
                return;
            }
        };

        let metadata = match self.retrieve(job_id).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(job_id = %job_id, "Reporting status without metadata: {}", e);
                None
            }
        };

        let change = StatusChange {
            job_id: job_id.to_string(),
            status,
            check_in,
            metadata,
        };
        self.spawn_report(url, change);
    }

    fn spawn_report(&self, url: String, change: StatusChange) {
        let client = self.hook_client.clone();
        let hooks = Arc::clone(&self.hooks);
        let max_attempts = self.config.max_attempts;
        let unit = self.config.backoff_unit;

        tokio::spawn(async move {
            let mut fails = 0;
            loop {
                match client.report_status(&url, &change).await {
                    Ok(()) => {
                        // No further status will be reported for this job.
                        if matches!(change.status, Status::Success | Status::Stopped) {
                            hooks.remove(&change.job_id);
                        }
                        return;
                    }
                    Err(e) => {
                        fails += 1;
                        if fails >= max_attempts {
                            error!(
                                job_id = %change.job_id,
                                "Report status {} abandoned after {} attempts: {}",
                                change.status,
                                fails,
                                e
                            );
                            hooks.remove(&change.job_id);
                            return;
                        }
                        let delay = backoff(unit, fails);
                        warn!(job_id = %change.job_id, "Report status failed ({}), retrying in {:?}", e, delay);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });
    }

    /// Persist the full record. TTL follows the job kind.
    pub async fn save(&self, stats: JobStats) {
        self.submit(StatsOp::Save(stats)).await;
    }

    /// Read a record; periodic records with executions also list them.
    pub async fn retrieve(&self, job_id: &str) -> JobServiceResult<JobStats> {
        if job_id.is_empty() {
            return Err(JobServiceError::Validation("empty job id".to_string()));
        }

        let hash = self.kv.hget_all(&self.keys.job_stats(job_id)).await?;
        if hash.is_empty() {
            return Err(JobServiceError::NotFound(format!("job '{}'", job_id)));
        }

        let mut stats = JobStats::from_hash(job_id, &hash);
        if stats.is_multiple_executions {
            stats.executions = self
                .kv
                .zrange_with_scores(&self.keys.upstream_job_executions(job_id))
                .await?
                .into_iter()
                .map(|(id, _)| id)
                .collect();
        }
        Ok(stats)
    }

    /// Partial update; `update_time` is refreshed too.
    pub async fn update(&self, job_id: &str, fields: Vec<(String, String)>) {
        self.submit(StatsOp::Update {
            job_id: job_id.to_string(),
            fields,
        })
        .await;
    }

    /// Write the status and report it to the job's hook.
    pub async fn set_job_status(&self, job_id: &str, status: Status) {
        self.submit(StatsOp::SetStatus {
            job_id: job_id.to_string(),
            status,
        })
        .await;
    }

    /// Record a progress message and report it with status `Running`.
    pub async fn check_in(&self, job_id: &str, message: &str) {
        self.submit(StatsOp::CheckIn {
            job_id: job_id.to_string(),
            message: message.to_string(),
            at: now_epoch(),
        })
        .await;
    }

    /// Record the exact death score of the job's dead queue entry near `die_at`.
    pub async fn die_at(&self, job_id: &str, die_at: i64) {
        self.submit(StatsOp::DieAt {
            job_id: job_id.to_string(),
            die_at,
        })
        .await;
    }

    /// Register a status hook. Unless `cache_only`, the hook is also persisted
    /// and announced to peer replicas.
    pub async fn register_hook(
        &self,
        job_id: &str,
        url: &str,
        cache_only: bool,
    ) -> JobServiceResult<()> {
        if job_id.is_empty() {
            return Err(JobServiceError::Validation("empty job id".to_string()));
        }
        if !is_valid_url(url) {
            return Err(JobServiceError::Validation(format!(
                "invalid hook url '{}'",
                url
            )));
        }

        self.hooks.add(job_id, url);
        if cache_only {
            return Ok(());
        }

        let event = BusEvent::RegisterHook(HookData {
            job_id: job_id.to_string(),
            hook_url: url.to_string(),
        });
        let batch = Batch::new()
            .hset(
                self.keys.job_stats(job_id),
                vec![(FIELD_STATUS_HOOK.to_string(), url.to_string())],
            )
            .publish(self.keys.notifications(), event.encode()?);
        self.kv.exec(batch).await?;
        debug!(job_id = %job_id, "Status hook registered: {}", url);
        Ok(())
    }

    /// Hook URL of a job: cache first, then the stats record.
    pub async fn get_hook(&self, job_id: &str) -> JobServiceResult<String> {
        if let Some(url) = self.hooks.get(job_id) {
            return Ok(url);
        }

        match self
            .kv
            .hget(&self.keys.job_stats(job_id), FIELD_STATUS_HOOK)
            .await?
        {
            Some(url) if !url.is_empty() => {
                self.hooks.add(job_id, &url);
                Ok(url)
            }
            _ => Err(JobServiceError::NotFound(format!(
                "status hook of job '{}'",
                job_id
            ))),
        }
    }

    /// Give a periodic record the TTL it never had.
    pub async fn expire_periodic_job_stats(&self, job_id: &str) -> JobServiceResult<()> {
        self.kv
            .expire(&self.keys.job_stats(job_id), ONE_WEEK_SECS)
            .await?;
        Ok(())
    }

    /// Append executions to the upstream job's execution set.
    pub async fn attach_execution(&self, upstream_id: &str, execution_ids: &[String]) {
        if execution_ids.is_empty() {
            return;
        }
        let executions = execution_ids
            .iter()
            .map(|id| (id.clone(), self.next_execution_score()))
            .collect();
        self.submit(StatsOp::AttachExecutions {
            upstream_id: upstream_id.to_string(),
            executions,
        })
        .await;
    }

    /// Strictly increasing millisecond score.
    fn next_execution_score(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut current = self.last_execution_score.load(Ordering::SeqCst);
        loop {
            let next = now.max(current + 1);
            match self.last_execution_score.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Push `command` for `job_id` locally and, unless `cache_only`, fire it
    /// to every replica.
    pub async fn send_command(
        &self,
        job_id: &str,
        command: OpCommand,
        cache_only: bool,
    ) -> JobServiceResult<()> {
        self.commands.push(job_id, command)?;
        if !cache_only {
            let event = BusEvent::FireCommand(job_id.to_string(), command);
            self.kv
                .publish(&self.keys.notifications(), &event.encode()?)
                .await?;
        }
        Ok(())
    }

    /// Pending command of `job_id`, if fired within the validity window.
    pub fn ctl_command(&self, job_id: &str) -> JobServiceResult<OpCommand> {
        self.commands
            .get(job_id)
            .ok_or_else(|| JobServiceError::NotFound(format!("op command of job '{}'", job_id)))
    }

    /// Consume the command of `job_id` once it has been honoured.
    pub fn pop_command(&self, job_id: &str) -> Option<OpCommand> {
        self.commands.pop(job_id)
    }
}

#[cfg(test)]
#[path = "stats_manager_tests.rs"]
mod tests;
