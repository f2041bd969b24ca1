//! Jobs registered by the binary.

use std::time::Duration;

use async_trait::async_trait;
use jobservice_protocols::{Job, JobContext, JobError, OpCommand, Parameters};

pub(crate) const DEMO: &str = "DEMO";
pub(crate) const SAMPLE_FAIL: &str = "SAMPLE_FAIL";

const DEMO_STEPS: u32 = 5;

/// Logs a few steps, checking in after each and honouring stop and cancel
/// between them.
pub(crate) struct DemoJob {
    step: Duration,
}

impl DemoJob {
    pub(crate) fn new(step: Duration) -> Self {
        Self { step }
    }
}

#[async_trait]
impl Job for DemoJob {
    async fn run(&self, ctx: &JobContext, params: &Parameters) -> Result<(), JobError> {
        ctx.logger()
            .info(&format!("Demo job started with {} parameter(s)", params.len()));

        for step in 1..=DEMO_STEPS {
            match ctx.op_command() {
                Some(OpCommand::Stop) => {
                    ctx.logger().info("Demo job stopped");
                    return Err(JobError::Stopped);
                }
                Some(OpCommand::Cancel) => {
                    ctx.logger().info("Demo job cancelled");
                    return Err(JobError::Cancelled);
                }
                _ => {}
            }

            ctx.check_in(format!("step {}/{}", step, DEMO_STEPS)).await;
            tokio::select! {
                _ = ctx.system_context().cancelled() => {
                    return Err(JobError::failed("system is shutting down"));
                }
                _ = tokio::time::sleep(self.step) => {}
            }
        }

        ctx.logger().info("Demo job done");
        Ok(())
    }
}

/// Always fails, walking the retry and dead queues.
pub(crate) struct SampleFailJob;

#[async_trait]
impl Job for SampleFailJob {
    fn max_fails(&self) -> u64 {
        2
    }

    async fn run(&self, ctx: &JobContext, _params: &Parameters) -> Result<(), JobError> {
        ctx.logger().warn("Sample failure");
        Err(JobError::failed("sample failure"))
    }
}
