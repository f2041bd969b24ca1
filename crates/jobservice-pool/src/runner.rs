//! Runs one dequeued job through its lifecycle.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};
use std::time::Duration;

use futures::FutureExt;
use jobservice_opm::JobStatsManager;
use jobservice_protocols::stats::{FIELD_MULTIPLE_EXECUTIONS, FIELD_UPSTREAM_JOB_ID};
use jobservice_protocols::utils::{make_identifier, now_epoch};
use jobservice_protocols::{
    Job, JobContext, JobError, JobKind, JobLogger, JobRequest, JobServiceError, JobStats,
    LaunchJobFn, MemoryJobLogger, QueuedJob, Status,
};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dedup::DeDuplicator;
use crate::logger::JobLoggerFactory;
use crate::queue::{BackendQueue, retry_backoff_secs};
use crate::registry::JobRegistry;

/// Fail count given to a panicked job so it is never retried.
const PANIC_FAILS: u64 = 1 << 32;

thread_local! {
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Record the stack of every panic on the panicking thread, so a caught
/// handler panic can be written to the job log.
pub(crate) fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = format!("{}\n{}", info, Backtrace::force_capture());
            PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn take_panic_trace() -> Option<String> {
    PANIC_TRACE.with(|slot| slot.borrow_mut().take())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

enum Outcome {
    Success,
    Stopped,
    Cancelled,
    Failed(String),
    Panicked(String),
}

/// What the runner knows about a job before running it.
struct Execution {
    kind: JobKind,
    /// Policy or parent job whose commands also reach this execution.
    upstream: Option<String>,
}

pub(crate) struct JobRunner {
    pub(crate) registry: Arc<JobRegistry>,
    pub(crate) queue: Arc<BackendQueue>,
    pub(crate) stats: Arc<JobStatsManager>,
    pub(crate) dedup: DeDuplicator,
    pub(crate) loggers: JobLoggerFactory,
    pub(crate) launcher: Arc<RwLock<Option<LaunchJobFn>>>,
    pub(crate) system: CancellationToken,
    pub(crate) die_at_delay: Duration,
}

impl JobRunner {
    pub(crate) async fn run(&self, mut job: QueuedJob) {
        let Some(handler) = self.registry.get(&job.name) else {
            warn!(job_id = %job.id, "No handler registered for {}, burying job", job.name);
            job.err = Some(format!("unknown job name '{}'", job.name));
            job.failed_at = now_epoch();
            if let Err(e) = self.queue.bury(&job, job.failed_at).await {
                error!(job_id = %job.id, "Failed to bury job: {}", e);
            }
            return;
        };

        let Some(execution) = self.prepare(&mut job).await else {
            return;
        };

        let logger: Arc<dyn JobLogger> = match self.loggers.create(&job.id).await {
            Ok(logger) => logger,
            Err(e) => {
                warn!(job_id = %job.id, "Job log unavailable, logging to memory: {}", e);
                Arc::new(MemoryJobLogger::new())
            }
        };

        self.stats.set_job_status(&job.id, Status::Running).await;
        if let Err(e) = self.queue.track(&job.id, now_epoch()).await {
            warn!(job_id = %job.id, "Failed to track running job: {}", e);
        }
        let ctx = self.context(&job, &execution, Arc::clone(&logger));
        debug!(job_id = %job.id, "Running {}", job.name);

        let outcome = match AssertUnwindSafe(handler.run(&ctx, &job.args))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Outcome::Success,
            Ok(Err(JobError::Stopped)) => Outcome::Stopped,
            Ok(Err(JobError::Cancelled)) => Outcome::Cancelled,
            Ok(Err(JobError::Failed(message))) => Outcome::Failed(message),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let trace = take_panic_trace()
                    .unwrap_or_else(|| Backtrace::force_capture().to_string());
                logger.error(&format!("Job panicked: {}\n{}", message, trace));
                Outcome::Panicked(message)
            }
        };

        self.finish(job, handler.as_ref(), outcome, logger.as_ref())
            .await;
    }

    /// Resolve the stats record of `job`. Periodic triggers become a fresh
    /// execution. `None` means the job must not run.
    async fn prepare(&self, job: &mut QueuedJob) -> Option<Execution> {
        if job.periodic {
            return Some(self.start_execution(job).await);
        }

        match self.stats.retrieve(&job.id).await {
            Ok(stats) if stats.status == Status::Stopped => {
                info!(job_id = %job.id, "Job was stopped before it ran, skipping");
                self.release_unique(job).await;
                None
            }
            Ok(stats) => Some(Execution {
                kind: stats.job_kind,
                upstream: Some(stats.upstream_job_id).filter(|u| !u.is_empty()),
            }),
            Err(e) => {
                if !e.is_not_found() {
                    warn!(job_id = %job.id, "Failed to read job stats: {}", e);
                }
                // Queued behind the control plane's back; give it a record.
                let mut stats = JobStats::new(&job.id, &job.name, JobKind::Generic);
                stats.is_unique = job.unique;
                stats.parameters = job.args.clone();
                self.stats.save(stats).await;
                Some(Execution {
                    kind: JobKind::Generic,
                    upstream: None,
                })
            }
        }
    }

    /// Turn a periodic trigger into a tracked execution of its policy.
    async fn start_execution(&self, job: &mut QueuedJob) -> Execution {
        let policy_id = job.id.clone();
        let execution_id = make_identifier();

        let mut stats = JobStats::new(&execution_id, &job.name, JobKind::Generic);
        stats.upstream_job_id = policy_id.clone();
        stats.parameters = job.args.clone();
        stats.run_at = job.enqueued_at;

        match self.stats.get_hook(&policy_id).await {
            Ok(url) => {
                if let Err(e) = self.stats.register_hook(&execution_id, &url, true).await {
                    warn!(job_id = %execution_id, "Failed to propagate status hook: {}", e);
                }
                stats.web_hook_url = url;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(policy_id = %policy_id, "Failed to read status hook: {}", e),
        }

        self.stats.save(stats).await;
        self.stats
            .update(
                &policy_id,
                vec![(FIELD_MULTIPLE_EXECUTIONS.to_string(), "true".to_string())],
            )
            .await;
        self.stats
            .attach_execution(&policy_id, &[execution_id.clone()])
            .await;

        info!(policy_id = %policy_id, job_id = %execution_id, "Periodic execution of {} started", job.name);
        job.id = execution_id;
        job.periodic = false;
        Execution {
            kind: JobKind::Generic,
            upstream: Some(policy_id),
        }
    }

    fn context(&self, job: &QueuedJob, execution: &Execution, logger: Arc<dyn JobLogger>) -> JobContext {
        let check_in = {
            let stats = Arc::clone(&self.stats);
            let job_id = job.id.clone();
            Arc::new(move |message: String| {
                let stats = Arc::clone(&stats);
                let job_id = job_id.clone();
                async move { stats.check_in(&job_id, &message).await }.boxed()
            })
        };

        let op_command = {
            let stats = Arc::clone(&self.stats);
            let job_id = job.id.clone();
            let upstream = execution.upstream.clone();
            Arc::new(move || {
                stats.ctl_command(&job_id).ok().or_else(|| {
                    upstream
                        .as_deref()
                        .and_then(|u| stats.ctl_command(u).ok())
                })
            })
        };

        let launch_job = {
            let launcher = self.launcher.read().clone();
            let stats = Arc::clone(&self.stats);
            let current_id = job.id.clone();
            let current_name = job.name.clone();
            Arc::new(move |request: JobRequest| {
                let launcher = launcher.clone();
                let stats = Arc::clone(&stats);
                let current_id = current_id.clone();
                let current_name = current_name.clone();
                async move {
                    if request.job.name == current_name {
                        return Err(JobServiceError::Validation(format!(
                            "job '{}' cannot launch itself",
                            current_name
                        )));
                    }
                    let Some(launcher) = launcher else {
                        return Err(JobServiceError::Internal(
                            "job launching is not available".to_string(),
                        ));
                    };

                    let mut child = launcher(request).await?;
                    child.upstream_job_id = current_id.clone();
                    stats
                        .update(
                            &child.job_id,
                            vec![(FIELD_UPSTREAM_JOB_ID.to_string(), current_id.clone())],
                        )
                        .await;
                    stats
                        .update(
                            &current_id,
                            vec![(FIELD_MULTIPLE_EXECUTIONS.to_string(), "true".to_string())],
                        )
                        .await;
                    stats
                        .attach_execution(&current_id, &[child.job_id.clone()])
                        .await;
                    Ok::<JobStats, JobServiceError>(child)
                }
                .boxed()
            })
        };

        JobContext::new(
            job.id.clone(),
            job.name.clone(),
            execution.kind,
            self.system.clone(),
            logger,
        )
        .with_check_in(check_in)
        .with_op_command(op_command)
        .with_launch_job(launch_job)
    }

    async fn release_unique(&self, job: &QueuedJob) {
        if job.unique {
            if let Err(e) = self.dedup.del_unique_sign(&job.name, &job.args).await {
                warn!(job_id = %job.id, "Failed to release uniqueness lock: {}", e);
            }
        }
    }

    async fn finish(&self, mut job: QueuedJob, handler: &dyn Job, outcome: Outcome, logger: &dyn JobLogger) {
        let now = now_epoch();
        let status = match &outcome {
            Outcome::Success => Status::Success,
            Outcome::Stopped => Status::Stopped,
            Outcome::Cancelled => Status::Cancelled,
            Outcome::Failed(_) | Outcome::Panicked(_) => Status::Error,
        };
        self.stats.set_job_status(&job.id, status).await;
        if let Err(e) = self.queue.untrack(&job.id).await {
            warn!(job_id = %job.id, "Failed to untrack job: {}", e);
        }
        self.release_unique(&job).await;
        if matches!(outcome, Outcome::Stopped | Outcome::Cancelled) {
            self.stats.pop_command(&job.id);
        }

        let message = match outcome {
            Outcome::Success => {
                info!(job_id = %job.id, "Job {} succeeded", job.name);
                logger.info("Job succeeded");
                return;
            }
            Outcome::Stopped => {
                info!(job_id = %job.id, "Job {} stopped", job.name);
                logger.info("Job stopped");
                return;
            }
            Outcome::Cancelled => "job is cancelled".to_string(),
            Outcome::Failed(message) => message,
            Outcome::Panicked(message) => {
                error!(job_id = %job.id, "Job {} panicked: {}", job.name, message);
                job.fails = PANIC_FAILS;
                job.err = Some(format!("panic: {}", message));
                job.failed_at = now;
                if let Err(e) = self.queue.bury(&job, now).await {
                    error!(job_id = %job.id, "Failed to bury job: {}", e);
                }
                let stats = Arc::clone(&self.stats);
                let delay = self.die_at_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    stats.die_at(&job.id, now).await;
                });
                return;
            }
        };

        logger.error(&format!("Job failed: {}", message));
        job.fails += 1;
        job.err = Some(message);
        job.failed_at = now;

        if handler.should_retry() && job.fails < handler.max_fails() {
            let at = now + retry_backoff_secs(job.fails);
            warn!(job_id = %job.id, "Job {} failed ({} fails), retry at {}", job.name, job.fails, at);
            if let Err(e) = self.queue.retry_at(&job, at).await {
                error!(job_id = %job.id, "Failed to schedule retry: {}", e);
            }
        } else {
            warn!(job_id = %job.id, "Job {} failed ({} fails), moving to dead queue", job.name, job.fails);
            if let Err(e) = self.queue.bury(&job, now).await {
                error!(job_id = %job.id, "Failed to bury job: {}", e);
                return;
            }
            self.stats.die_at(&job.id, now).await;
        }
    }
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
