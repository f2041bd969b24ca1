//! Job handler contract and the context injected into running jobs.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::{JobError, JobServiceError, JobServiceResult};
use crate::job::Parameters;
use crate::logger::{JobLogger, MemoryJobLogger};
use crate::request::JobRequest;
use crate::stats::JobStats;
use crate::status::{JobKind, OpCommand};

/// Fail count at which a job stops being retried when the handler does not
/// override [`Job::max_fails`].
pub const DEFAULT_MAX_FAILS: u64 = 4;

/// Forwards a check-in message to the stats manager.
pub type CheckInFn = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Non-blocking poll for a pending stop/cancel command.
pub type OpCommandFn = Arc<dyn Fn() -> Option<OpCommand> + Send + Sync>;

/// Submits a child job on behalf of the running job.
pub type LaunchJobFn =
    Arc<dyn Fn(JobRequest) -> BoxFuture<'static, JobServiceResult<JobStats>> + Send + Sync>;

/// A registered unit of work.
///
/// Handlers are registered once under a job name. Every execution calls
/// [`Job::run`] with a fresh [`JobContext`].
#[async_trait]
pub trait Job: Send + Sync {
    /// Fail count at which the job is moved to the dead queue.
    fn max_fails(&self) -> u64 {
        DEFAULT_MAX_FAILS
    }

    /// Whether a failed run may be retried at all.
    fn should_retry(&self) -> bool {
        true
    }

    /// Validate submission parameters before the job is queued.
    fn validate(&self, _params: &Parameters) -> JobServiceResult<()> {
        Ok(())
    }

    /// Execute the job.
    ///
    /// Return [`JobError::Stopped`] or [`JobError::Cancelled`] after honouring
    /// an operator command.
    async fn run(&self, ctx: &JobContext, params: &Parameters) -> Result<(), JobError>;

    /// Implementation type name, used to keep handler registration 1:1.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Capabilities available to a job during one execution.
#[derive(Clone)]
pub struct JobContext {
    job_id: String,
    job_name: String,
    kind: JobKind,
    system: CancellationToken,
    logger: Arc<dyn JobLogger>,
    check_in: CheckInFn,
    op_command: OpCommandFn,
    launch_job: LaunchJobFn,
}

impl JobContext {
    pub fn new(
        job_id: impl Into<String>,
        job_name: impl Into<String>,
        kind: JobKind,
        system: CancellationToken,
        logger: Arc<dyn JobLogger>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            job_name: job_name.into(),
            kind,
            system,
            logger,
            check_in: Arc::new(|_: String| async {}.boxed()),
            op_command: Arc::new(|| None::<OpCommand>),
            launch_job: Arc::new(|_: JobRequest| {
                async {
                    Err::<JobStats, _>(JobServiceError::Internal(
                        "launching jobs is not supported in this context".to_string(),
                    ))
                }
                .boxed()
            }),
        }
    }

    /// Context with no service behind it: check-ins are dropped, no command is
    /// ever pending and child launches fail.
    pub fn detached(job_id: impl Into<String>, job_name: impl Into<String>) -> Self {
        Self::new(
            job_id,
            job_name,
            JobKind::Generic,
            CancellationToken::new(),
            Arc::new(MemoryJobLogger::new()),
        )
    }

    pub fn with_check_in(mut self, f: CheckInFn) -> Self {
        self.check_in = f;
        self
    }

    pub fn with_op_command(mut self, f: OpCommandFn) -> Self {
        self.op_command = f;
        self
    }

    pub fn with_launch_job(mut self, f: LaunchJobFn) -> Self {
        self.launch_job = f;
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn logger(&self) -> &dyn JobLogger {
        self.logger.as_ref()
    }

    /// Token cancelled when the service shuts down.
    pub fn system_context(&self) -> &CancellationToken {
        &self.system
    }

    pub async fn check_in(&self, message: impl Into<String>) {
        (self.check_in)(message.into()).await;
    }

    pub fn op_command(&self) -> Option<OpCommand> {
        (self.op_command)()
    }

    pub async fn launch_job(&self, request: JobRequest) -> JobServiceResult<JobStats> {
        (self.launch_job)(request).await
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("job_name", &self.job_name)
            .field("kind", &self.kind)
            .finish()
    }
}
