//! Control plane façade over the worker pool.

use std::sync::{Arc, Weak};

use futures::FutureExt;
use jobservice_protocols::policy::parse_cron;
use jobservice_protocols::utils::is_valid_url;
use jobservice_protocols::{
    JobActionRequest, JobKind, JobRequest, JobServiceError, JobServiceResult, JobStats,
    LaunchJobFn, OpCommand,
};
use tracing::info;

use crate::pool::{PoolStats, WorkerPool};

/// Validates submissions and routes operator actions to the pool.
pub struct Controller {
    pool: Arc<WorkerPool>,
}

impl Controller {
    /// Build the controller and wire it as the pool's child job launcher.
    pub fn new(pool: Arc<WorkerPool>) -> Arc<Self> {
        let controller = Arc::new(Self {
            pool: Arc::clone(&pool),
        });

        let weak: Weak<Controller> = Arc::downgrade(&controller);
        let launcher: LaunchJobFn = Arc::new(move |request: JobRequest| {
            let weak = weak.clone();
            async move {
                let Some(controller) = weak.upgrade() else {
                    return Err(JobServiceError::Internal(
                        "controller is gone".to_string(),
                    ));
                };
                controller.launch_job(request).await
            }
            .boxed()
        });
        pool.set_launcher(launcher);

        controller
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Validate `request` and submit it according to its kind.
    pub async fn launch_job(&self, request: JobRequest) -> JobServiceResult<JobStats> {
        self.validate(&request)?;

        let job = request.job;
        let hook = job.status_hook.as_deref();
        let stats = match job.metadata.kind {
            JobKind::Generic => {
                self.pool
                    .enqueue(&job.name, job.parameters, job.metadata.unique, hook)
                    .await?
            }
            JobKind::Scheduled => {
                let delay = job.metadata.schedule_delay.unwrap_or_default();
                self.pool
                    .enqueue_in(&job.name, delay, job.parameters, job.metadata.unique, hook)
                    .await?
            }
            JobKind::Periodic => {
                let cron_spec = job.metadata.cron_spec.unwrap_or_default();
                self.pool
                    .periodically_enqueue(&job.name, job.parameters, &cron_spec, hook)
                    .await?
            }
        };

        info!(job_id = %stats.job_id, "Launched {} job {}", stats.job_kind, stats.job_name);
        Ok(stats)
    }

    fn validate(&self, request: &JobRequest) -> JobServiceResult<()> {
        let job = &request.job;
        let Some(handler) = self.pool.handler(&job.name) else {
            return Err(JobServiceError::Validation(format!(
                "job '{}' is not registered",
                job.name
            )));
        };
        handler.validate(&job.parameters)?;

        match job.metadata.kind {
            JobKind::Generic => {}
            JobKind::Scheduled => {
                if job.metadata.schedule_delay.unwrap_or_default() == 0 {
                    return Err(JobServiceError::Validation(
                        "scheduled job needs a positive schedule_delay".to_string(),
                    ));
                }
            }
            JobKind::Periodic => match job.metadata.cron_spec.as_deref() {
                Some(spec) if !spec.trim().is_empty() => {
                    parse_cron(spec)?;
                }
                _ => {
                    return Err(JobServiceError::Validation(
                        "periodic job needs a cron_spec".to_string(),
                    ));
                }
            },
        }

        if let Some(url) = job.status_hook.as_deref() {
            if !is_valid_url(url) {
                return Err(JobServiceError::Validation(format!(
                    "invalid status hook '{}'",
                    url
                )));
            }
        }
        Ok(())
    }

    pub async fn get_job(&self, job_id: &str) -> JobServiceResult<JobStats> {
        self.pool.stats_manager().retrieve(job_id).await
    }

    pub async fn stop_job(&self, job_id: &str) -> JobServiceResult<()> {
        self.pool.stop_job(job_id).await
    }

    pub async fn cancel_job(&self, job_id: &str) -> JobServiceResult<()> {
        self.pool.cancel_job(job_id).await
    }

    pub async fn retry_job(&self, job_id: &str) -> JobServiceResult<()> {
        self.pool.retry_job(job_id).await
    }

    /// Apply `{ "action": "stop" | "cancel" | "retry" }` to a job.
    pub async fn handle_action(
        &self,
        job_id: &str,
        action: &JobActionRequest,
    ) -> JobServiceResult<()> {
        match action.command()? {
            OpCommand::Stop => self.stop_job(job_id).await,
            OpCommand::Cancel => self.cancel_job(job_id).await,
            OpCommand::Retry => self.retry_job(job_id).await,
        }
    }

    /// Heartbeat records of every pool in the namespace.
    pub async fn check_status(&self) -> JobServiceResult<Vec<PoolStats>> {
        self.pool.stats().await
    }

    pub async fn get_job_log(&self, job_id: &str) -> JobServiceResult<String> {
        self.pool.loggers().read_log(job_id).await
    }
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod tests;
