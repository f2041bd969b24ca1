//! Operator commands awaiting a poll by the running job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use jobservice_protocols::utils::now_epoch;
use jobservice_protocols::{JobServiceError, JobServiceResult, OpCommand};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Seconds a fired command stays valid.
pub const COMMAND_VALID_SECS: i64 = 5 * 60;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy)]
struct PendingCommand {
    command: OpCommand,
    fired_at: i64,
}

/// Commands keyed by job id, each stamped with its fire time.
#[derive(Debug, Default)]
pub struct OpCommandStore {
    commands: RwLock<HashMap<String, PendingCommand>>,
}

impl OpCommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `command` for `job_id`, replacing any earlier one.
    pub fn push(&self, job_id: &str, command: OpCommand) -> JobServiceResult<()> {
        self.push_at(job_id, command, now_epoch())
    }

    fn push_at(&self, job_id: &str, command: OpCommand, fired_at: i64) -> JobServiceResult<()> {
        if job_id.is_empty() {
            return Err(JobServiceError::Validation("empty job id".to_string()));
        }
        if !command.is_bus_command() {
            return Err(JobServiceError::Validation(format!(
                "command '{}' cannot be pushed",
                command
            )));
        }
        self.commands
            .write()
            .insert(job_id.to_string(), PendingCommand { command, fired_at });
        Ok(())
    }

    /// Pending command of `job_id` while still within the validity window.
    pub fn get(&self, job_id: &str) -> Option<OpCommand> {
        self.get_at(job_id, now_epoch())
    }

    fn get_at(&self, job_id: &str, now: i64) -> Option<OpCommand> {
        self.commands
            .read()
            .get(job_id)
            .filter(|p| now - p.fired_at <= COMMAND_VALID_SECS)
            .map(|p| p.command)
    }

    /// Remove and return the command of `job_id`.
    pub fn pop(&self, job_id: &str) -> Option<OpCommand> {
        self.commands.write().remove(job_id).map(|p| p.command)
    }

    /// Drop commands older than the validity window. Returns how many.
    pub fn sweep(&self) -> usize {
        self.sweep_at(now_epoch())
    }

    fn sweep_at(&self, now: i64) -> usize {
        let mut commands = self.commands.write();
        let before = commands.len();
        commands.retain(|_, p| now - p.fired_at <= COMMAND_VALID_SECS);
        before - commands.len()
    }

    /// Run the hourly sweeper until `cancel` fires.
    pub fn start_sweeper(self: &Arc<Self>, cancel: CancellationToken) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Op command sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let swept = store.sweep();
                        if swept > 0 {
                            debug!("Swept {} outdated op commands", swept);
                        }
                    }
                }
            }
        });
    }
}
