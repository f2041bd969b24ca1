//! Worker pool: handler registry, workers and background actors.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use chrono::Utc;
use jobservice_kv::{Batch, KeyBuilder, KvStore};
use jobservice_opm::JobStatsManager;
use jobservice_period::{Enqueuer, PolicyStore, Scheduler, Sweeper};
use jobservice_protocols::stats::FIELD_DIE_AT;
use jobservice_protocols::utils::{make_identifier, now_epoch};
use jobservice_protocols::{
    Job, JobKind, JobServiceError, JobServiceResult, JobStats, LaunchJobFn, OpCommand, Parameters,
    Policy, QueuedJob, Status,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::MessageBus;
use crate::config::PoolConfig;
use crate::dedup::DeDuplicator;
use crate::logger::JobLoggerFactory;
use crate::queue::BackendQueue;
use crate::reaper::Reaper;
use crate::registry::JobRegistry;
use crate::runner::{JobRunner, install_panic_hook};

/// A pool without a heartbeat for this long is reported dead.
pub const HEARTBEAT_DEAD_SECS: i64 = 10;

const FIELD_POOL_ID: &str = "pool_id";
const FIELD_STARTED_AT: &str = "started_at";
const FIELD_HEARTBEAT_AT: &str = "heartbeat_at";
const FIELD_JOB_NAMES: &str = "job_names";
const FIELD_CONCURRENCY: &str = "concurrency";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolStatus {
    Healthy,
    Dead,
}

/// Heartbeat record of one worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub pool_id: String,
    pub started_at: i64,
    pub heartbeat_at: i64,
    pub job_names: Vec<String>,
    pub concurrency: usize,
    pub status: PoolStatus,
}

impl PoolStats {
    pub(crate) fn from_hash(pool_id: &str, hash: &HashMap<String, String>, now: i64) -> Self {
        let int = |field: &str| -> i64 {
            hash.get(field)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default()
        };
        let heartbeat_at = int(FIELD_HEARTBEAT_AT);
        Self {
            pool_id: pool_id.to_string(),
            started_at: int(FIELD_STARTED_AT),
            heartbeat_at,
            job_names: hash
                .get(FIELD_JOB_NAMES)
                .map(|names| {
                    names
                        .split(',')
                        .filter(|n| !n.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            concurrency: int(FIELD_CONCURRENCY).max(0) as usize,
            status: if now - heartbeat_at > HEARTBEAT_DEAD_SECS {
                PoolStatus::Dead
            } else {
                PoolStatus::Healthy
            },
        }
    }
}

/// Runs registered jobs from the shared queues.
///
/// One pool per replica. Every pool in a namespace shares queues, policies
/// and stats through the KV store and keeps its caches in step through the
/// [`MessageBus`].
pub struct WorkerPool {
    id: String,
    kv: Arc<dyn KvStore>,
    keys: KeyBuilder,
    config: PoolConfig,
    registry: Arc<JobRegistry>,
    queue: Arc<BackendQueue>,
    stats: Arc<JobStatsManager>,
    policies: Arc<PolicyStore>,
    enqueuer: Arc<Enqueuer>,
    scheduler: Scheduler,
    sweeper: Sweeper,
    bus: Arc<MessageBus>,
    dedup: DeDuplicator,
    loggers: JobLoggerFactory,
    launcher: Arc<RwLock<Option<LaunchJobFn>>>,
    started_at: AtomicI64,
    fetch_cursor: AtomicUsize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        kv: Arc<dyn KvStore>,
        namespace: &str,
        loggers: JobLoggerFactory,
        config: PoolConfig,
    ) -> JobServiceResult<Arc<Self>> {
        if config.workers == 0 {
            return Err(JobServiceError::Fatal(
                "worker pool needs at least one worker".to_string(),
            ));
        }

        let keys = KeyBuilder::new(namespace);
        let stats = JobStatsManager::new(Arc::clone(&kv), keys.clone(), config.stats.clone())?;
        let policies = Arc::new(PolicyStore::new());
        let enqueuer = Arc::new(Enqueuer::new(
            Arc::clone(&kv),
            keys.clone(),
            Arc::clone(&policies),
            Arc::clone(&stats),
            config.enqueuer.clone(),
        ));
        let scheduler = Scheduler::new(
            Arc::clone(&kv),
            keys.clone(),
            Arc::clone(&policies),
            Arc::clone(&stats),
            Arc::clone(&enqueuer),
        );
        let bus = Arc::new(MessageBus::new(
            Arc::clone(&kv),
            keys.clone(),
            Arc::clone(&policies),
            Arc::clone(&stats),
            config.bus.clone(),
        ));

        Ok(Arc::new(Self {
            id: make_identifier(),
            queue: Arc::new(BackendQueue::new(Arc::clone(&kv), keys.clone())),
            sweeper: Sweeper::new(Arc::clone(&kv), keys.clone(), Arc::clone(&stats)),
            dedup: DeDuplicator::new(Arc::clone(&kv), keys.clone()),
            registry: Arc::new(JobRegistry::new()),
            launcher: Arc::new(RwLock::new(None)),
            started_at: AtomicI64::new(0),
            fetch_cursor: AtomicUsize::new(0),
            tasks: Mutex::new(Vec::new()),
            kv,
            keys,
            config,
            stats,
            policies,
            enqueuer,
            scheduler,
            bus,
            loggers,
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stats_manager(&self) -> &Arc<JobStatsManager> {
        &self.stats
    }

    pub fn loggers(&self) -> &JobLoggerFactory {
        &self.loggers
    }

    pub fn queue(&self) -> &BackendQueue {
        &self.queue
    }

    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    pub fn register_job(&self, name: &str, handler: Arc<dyn Job>) -> JobServiceResult<()> {
        self.registry.register(name, handler)?;
        debug!("Registered job {}", name);
        Ok(())
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.registry.get(name)
    }

    pub fn is_known_job(&self, name: &str) -> bool {
        self.registry.is_known(name)
    }

    /// Hook used by running jobs to launch child jobs.
    pub fn set_launcher(&self, launcher: LaunchJobFn) {
        *self.launcher.write() = Some(launcher);
    }

    pub(crate) fn launcher(&self) -> Option<LaunchJobFn> {
        self.launcher.read().clone()
    }

    /// Connect and start every background actor. Fails if the store stays
    /// unreachable or the pool was already started.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> JobServiceResult<()> {
        if self.registry.is_empty() {
            return Err(JobServiceError::Fatal("no job is registered".to_string()));
        }
        let now = now_epoch();
        if self
            .started_at
            .compare_exchange(0, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(JobServiceError::Internal(
                "worker pool is already started".to_string(),
            ));
        }

        self.ping_store().await?;
        install_panic_hook();

        self.stats.start(cancel.clone())?;
        self.scheduler.load().await?;
        self.bus.start(cancel.clone()).await?;
        match self.sweeper.sweep(Utc::now()).await {
            Ok(n) => debug!("Startup sweep removed {} outdated delayed entries", n),
            Err(e) => warn!("Startup sweep failed: {}", e),
        }
        self.enqueuer.start(cancel.clone());

        let runner = Arc::new(JobRunner {
            registry: Arc::clone(&self.registry),
            queue: Arc::clone(&self.queue),
            stats: Arc::clone(&self.stats),
            dedup: self.dedup.clone(),
            loggers: self.loggers.clone(),
            launcher: Arc::clone(&self.launcher),
            system: cancel.clone(),
            die_at_delay: self.config.die_at_delay,
        });

        let reaper = Arc::new(Reaper::new(
            Arc::clone(&self.kv),
            self.keys.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.stats),
            self.id.clone(),
            self.registry.names(),
            self.config.reaper.clone(),
        ));

        let mut tasks = Vec::with_capacity(self.config.workers + 3);
        tasks.push(self.spawn_requeuer(cancel.clone()));
        tasks.push(self.spawn_heartbeat(cancel.clone()));
        tasks.push(reaper.start(cancel.clone()));
        for index in 0..self.config.workers {
            tasks.push(self.spawn_worker(index, Arc::clone(&runner), cancel.clone()));
        }
        self.tasks.lock().extend(tasks);

        info!(
            pool_id = %self.id,
            "Worker pool started with {} workers for {:?}",
            self.config.workers,
            self.registry.names()
        );
        Ok(())
    }

    /// Wait for the workers and background actors to exit after cancellation.
    pub async fn wait(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!("Worker pool task failed: {}", e);
            }
        }
        info!(pool_id = %self.id, "Worker pool stopped");
    }

    async fn ping_store(&self) -> JobServiceResult<()> {
        let mut last_error = None;
        for attempt in 1..=self.config.ping_attempts {
            match self.kv.ping().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let delay = self.config.ping_backoff.saturating_mul(attempt);
                    warn!("KV store ping {} failed ({}), retrying in {:?}", attempt, e, delay);
                    last_error = Some(e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Err(JobServiceError::Fatal(format!(
            "KV store unreachable after {} pings: {}",
            self.config.ping_attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn spawn_worker(
        self: &Arc<Self>,
        index: usize,
        runner: Arc<JobRunner>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            debug!("Worker {} started", index);
            // A job in flight always runs to the end; cancellation is only
            // observed between jobs.
            while !cancel.is_cancelled() {
                match pool.queue.dequeue(&pool.fetch_order(), &pool.id).await {
                    Ok(Some(claimed)) => {
                        runner.run(claimed.job.clone()).await;
                        if let Err(e) = pool.queue.ack(&claimed).await {
                            warn!(job_id = %claimed.job.id, "Failed to acknowledge job: {}", e);
                        }
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Worker {} failed to fetch: {}", index, e),
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pool.config.fetch_interval) => {}
                }
            }
            debug!("Worker {} stopped", index);
        })
    }

    /// Registered names, rotated on every call so no queue starves.
    fn fetch_order(&self) -> Vec<String> {
        let mut names = self.registry.names();
        if !names.is_empty() {
            let shift = self.fetch_cursor.fetch_add(1, Ordering::Relaxed) % names.len();
            names.rotate_left(shift);
        }
        names
    }

    fn spawn_requeuer(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.requeue_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = pool.queue.requeue_due(now_epoch()).await {
                            warn!("Requeue failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    fn spawn_heartbeat(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = pool.heartbeat(now_epoch()).await {
                            warn!("Heartbeat failed: {}", e);
                        }
                    }
                }
            }
            let batch = Batch::new()
                .zrem(pool.keys.worker_pools(), pool.id.clone())
                .del(pool.keys.worker_pool(&pool.id));
            if let Err(e) = pool.kv.exec(batch).await {
                warn!("Failed to deregister pool: {}", e);
            }
        })
    }

    pub(crate) async fn heartbeat(&self, now: i64) -> JobServiceResult<()> {
        let fields = vec![
            (FIELD_POOL_ID.to_string(), self.id.clone()),
            (
                FIELD_STARTED_AT.to_string(),
                self.started_at.load(Ordering::SeqCst).to_string(),
            ),
            (FIELD_HEARTBEAT_AT.to_string(), now.to_string()),
            (FIELD_JOB_NAMES.to_string(), self.registry.names().join(",")),
            (FIELD_CONCURRENCY.to_string(), self.config.workers.to_string()),
        ];
        let batch = Batch::new()
            .zadd(self.keys.worker_pools(), self.id.clone(), now)
            .hset(self.keys.worker_pool(&self.id), fields);
        self.kv.exec(batch).await?;
        Ok(())
    }

    /// Heartbeat records of every pool in the namespace.
    pub async fn stats(&self) -> JobServiceResult<Vec<PoolStats>> {
        self.stats_at(now_epoch()).await
    }

    pub(crate) async fn stats_at(&self, now: i64) -> JobServiceResult<Vec<PoolStats>> {
        let mut pools = Vec::new();
        for (pool_id, _) in self.kv.zrange_with_scores(&self.keys.worker_pools()).await? {
            let hash = self.kv.hget_all(&self.keys.worker_pool(&pool_id)).await?;
            if hash.is_empty() {
                continue;
            }
            pools.push(PoolStats::from_hash(&pool_id, &hash, now));
        }
        if pools.is_empty() {
            return Err(JobServiceError::NotFound("worker pool stats".to_string()));
        }
        Ok(pools)
    }

    /// Delete delayed entries that fell out of the enqueue horizon.
    pub async fn sweep_outdated(&self) -> JobServiceResult<usize> {
        self.sweeper.sweep(Utc::now()).await
    }

    fn ensure_known(&self, name: &str) -> JobServiceResult<()> {
        if !self.registry.is_known(name) {
            return Err(JobServiceError::Validation(format!(
                "job '{}' is not registered",
                name
            )));
        }
        Ok(())
    }

    /// Write the initial record, register the hook, then hand the job over.
    ///
    /// The record is written before the job becomes visible to workers so a
    /// worker never sees a job without stats.
    async fn submit(
        &self,
        job: &QueuedJob,
        mut stats: JobStats,
        status_hook: Option<&str>,
        run_at: Option<i64>,
    ) -> JobServiceResult<JobStats> {
        if let Some(url) = status_hook {
            stats.web_hook_url = url.to_string();
        }
        self.stats.save(stats.clone()).await;
        self.stats.sync().await;
        if let Some(url) = status_hook {
            self.stats.register_hook(&job.id, url, false).await?;
        }

        let queued = match run_at {
            Some(at) => self.queue.schedule(job, at).await,
            None => self.queue.enqueue(job).await,
        };
        queued?;
        Ok(stats)
    }

    async fn lock_unique(&self, unique: bool, name: &str, params: &Parameters) -> JobServiceResult<()> {
        if unique {
            self.dedup.must_unique(name, params).await?;
        }
        Ok(())
    }

    async fn unlock_unique(&self, unique: bool, name: &str, params: &Parameters) {
        if unique {
            if let Err(e) = self.dedup.del_unique_sign(name, params).await {
                warn!("Failed to release uniqueness lock of {}: {}", name, e);
            }
        }
    }

    /// Queue a job for immediate execution.
    pub async fn enqueue(
        &self,
        name: &str,
        params: Parameters,
        unique: bool,
        status_hook: Option<&str>,
    ) -> JobServiceResult<JobStats> {
        self.ensure_known(name)?;
        self.lock_unique(unique, name, &params).await?;

        let job = QueuedJob::new(name, params.clone()).with_unique(unique);
        let mut stats = JobStats::new(&job.id, name, JobKind::Generic);
        stats.is_unique = unique;
        stats.parameters = params.clone();

        match self.submit(&job, stats, status_hook, None).await {
            Ok(stats) => {
                info!(job_id = %job.id, "Enqueued job {}", name);
                Ok(stats)
            }
            Err(e) => {
                self.unlock_unique(unique, name, &params).await;
                Err(e)
            }
        }
    }

    /// Queue a job to run `delay_secs` from now.
    pub async fn enqueue_in(
        &self,
        name: &str,
        delay_secs: u64,
        params: Parameters,
        unique: bool,
        status_hook: Option<&str>,
    ) -> JobServiceResult<JobStats> {
        self.ensure_known(name)?;
        self.lock_unique(unique, name, &params).await?;

        let job = QueuedJob::new(name, params.clone()).with_unique(unique);
        let run_at = job.enqueued_at + delay_secs as i64;
        let mut stats = JobStats::new(&job.id, name, JobKind::Scheduled);
        stats.status = Status::Scheduled;
        stats.is_unique = unique;
        stats.parameters = params.clone();
        stats.run_at = run_at;

        match self.submit(&job, stats, status_hook, Some(run_at)).await {
            Ok(stats) => {
                info!(job_id = %job.id, "Scheduled job {} at {}", name, run_at);
                Ok(stats)
            }
            Err(e) => {
                self.unlock_unique(unique, name, &params).await;
                Err(e)
            }
        }
    }

    /// Run a job on a cron schedule. The returned record is the policy's.
    pub async fn periodically_enqueue(
        &self,
        name: &str,
        params: Parameters,
        cron_spec: &str,
        status_hook: Option<&str>,
    ) -> JobServiceResult<JobStats> {
        self.ensure_known(name)?;

        let mut policy = Policy::new(make_identifier(), name, params.clone(), cron_spec);
        if let Some(url) = status_hook {
            policy = policy.with_web_hook(url);
        }
        let (policy_id, next_run) = self.scheduler.schedule(policy).await?;

        let mut stats = JobStats::new(&policy_id, name, JobKind::Periodic);
        stats.status = Status::Scheduled;
        stats.cron_spec = cron_spec.to_string();
        stats.parameters = params;
        stats.run_at = next_run.map(|t| t.timestamp()).unwrap_or_default();
        stats.numeric_policy_id = self
            .policies
            .get(&policy_id)
            .map(|p| p.numeric_id)
            .unwrap_or_default();
        if let Some(url) = status_hook {
            stats.web_hook_url = url.to_string();
        }
        self.stats.save(stats.clone()).await;
        self.stats.sync().await;
        if let Some(url) = status_hook {
            self.stats.register_hook(&policy_id, url, false).await?;
        }

        info!(policy_id = %policy_id, "Periodic job {} scheduled with '{}'", name, cron_spec);
        Ok(stats)
    }

    /// Stop a job. What that means depends on its kind:
    ///
    /// - Generic: the running job is told to stop
    /// - Scheduled: the delayed entry is removed and the job marked stopped
    /// - Periodic: the policy is unscheduled and running executions stopped
    pub async fn stop_job(&self, job_id: &str) -> JobServiceResult<()> {
        let stats = self.stats.retrieve(job_id).await?;
        match stats.job_kind {
            JobKind::Generic => {
                if stats.status != Status::Running {
                    return Err(JobServiceError::Validation(format!(
                        "job '{}' is {}, only running jobs can be stopped",
                        job_id, stats.status
                    )));
                }
                self.stats.send_command(job_id, OpCommand::Stop, false).await
            }
            JobKind::Scheduled => {
                if stats.status == Status::Running {
                    return self.stats.send_command(job_id, OpCommand::Stop, false).await;
                }
                if stats.status.is_final() {
                    return Err(JobServiceError::Validation(format!(
                        "job '{}' is already {}",
                        job_id, stats.status
                    )));
                }
                if !self.queue.delete_scheduled_job(stats.run_at, job_id).await? {
                    // Already moved to its ready queue; the worker skips it.
                    debug!(job_id = %job_id, "Delayed entry not found at {}", stats.run_at);
                }
                self.stats.set_job_status(job_id, Status::Stopped).await;
                self.unlock_unique(stats.is_unique, &stats.job_name, &stats.parameters)
                    .await;
                info!(job_id = %job_id, "Scheduled job stopped");
                Ok(())
            }
            JobKind::Periodic => {
                self.scheduler.unschedule(job_id).await?;
                for execution in &stats.executions {
                    match self.stats.retrieve(execution).await {
                        Ok(e) if e.status == Status::Running => {
                            if let Err(e) =
                                self.stats.send_command(execution, OpCommand::Stop, false).await
                            {
                                warn!(job_id = %execution, "Failed to stop execution: {}", e);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => debug!(job_id = %execution, "Execution record unavailable: {}", e),
                    }
                }
                self.stats.set_job_status(job_id, Status::Stopped).await;
                info!(policy_id = %job_id, "Periodic job stopped");
                Ok(())
            }
        }
    }

    /// Cancel a running generic job.
    pub async fn cancel_job(&self, job_id: &str) -> JobServiceResult<()> {
        let stats = self.stats.retrieve(job_id).await?;
        if stats.job_kind != JobKind::Generic {
            return Err(JobServiceError::Validation(format!(
                "only generic jobs can be cancelled, '{}' is {}",
                job_id, stats.job_kind
            )));
        }
        if stats.status != Status::Running {
            return Err(JobServiceError::Validation(format!(
                "job '{}' is {}, only running jobs can be cancelled",
                job_id, stats.status
            )));
        }
        self.stats.send_command(job_id, OpCommand::Cancel, false).await
    }

    /// Put a dead job back on its ready queue.
    pub async fn retry_job(&self, job_id: &str) -> JobServiceResult<()> {
        let stats = self.stats.retrieve(job_id).await?;
        if stats.die_at == 0 {
            return Err(JobServiceError::Validation(format!(
                "job '{}' is not in the dead queue",
                job_id
            )));
        }
        if !self.queue.retry_dead_job(stats.die_at, job_id).await? {
            return Err(JobServiceError::NotFound(format!(
                "dead queue entry of job '{}'",
                job_id
            )));
        }
        self.stats
            .update(job_id, vec![(FIELD_DIE_AT.to_string(), "0".to_string())])
            .await;
        info!(job_id = %job_id, "Dead job requeued");
        Ok(())
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
