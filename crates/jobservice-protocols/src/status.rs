//! Job status state machine, job kinds and operator commands.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::JobServiceError;

/// Lifecycle status of a job.
///
/// ```text
/// Pending -> Scheduled -> Running -> {Success | Error | Stopped | Cancelled}
/// ```
///
/// `Error` and `Cancelled` may re-enter `Running` when the job is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Status {
    #[default]
    Pending,
    Scheduled,
    Running,
    Stopped,
    Cancelled,
    Error,
    Success,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "Pending",
            Status::Scheduled => "Scheduled",
            Status::Running => "Running",
            Status::Stopped => "Stopped",
            Status::Cancelled => "Cancelled",
            Status::Error => "Error",
            Status::Success => "Success",
        }
    }

    /// Position in the lifecycle. Final statuses share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            Status::Pending => 0,
            Status::Scheduled => 1,
            Status::Running => 2,
            Status::Stopped | Status::Cancelled | Status::Error | Status::Success => 3,
        }
    }

    pub fn is_final(&self) -> bool {
        self.rank() == 3
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: Status) -> bool {
        use Status::*;

        match (self, next) {
            (Pending, Scheduled | Running | Stopped | Cancelled | Error) => true,
            (Scheduled, Scheduled | Running | Stopped | Error) => true,
            // Check-ins re-report Running.
            (Running, Running | Success | Error | Stopped | Cancelled) => true,
            // Retry of a failed or cancelled execution.
            (Error | Cancelled, Running) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = JobServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Status::Pending),
            "Scheduled" => Ok(Status::Scheduled),
            "Running" => Ok(Status::Running),
            "Stopped" => Ok(Status::Stopped),
            "Cancelled" => Ok(Status::Cancelled),
            "Error" => Ok(Status::Error),
            "Success" => Ok(Status::Success),
            other => Err(JobServiceError::Validation(format!("unknown job status '{}'", other))),
        }
    }
}

/// Classification of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum JobKind {
    /// Runs as soon as a worker is free.
    #[default]
    Generic,
    /// Runs once after a delay.
    Scheduled,
    /// Runs on a cron schedule.
    Periodic,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Generic => "Generic",
            JobKind::Scheduled => "Scheduled",
            JobKind::Periodic => "Periodic",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = JobServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Generic" => Ok(JobKind::Generic),
            "Scheduled" => Ok(JobKind::Scheduled),
            "Periodic" => Ok(JobKind::Periodic),
            other => Err(JobServiceError::Validation(format!("unknown job kind '{}'", other))),
        }
    }
}

/// Out-of-band operator command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpCommand {
    Stop,
    Cancel,
    /// Invoked directly on the pool, never sent over the command bus.
    Retry,
}

impl OpCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpCommand::Stop => "stop",
            OpCommand::Cancel => "cancel",
            OpCommand::Retry => "retry",
        }
    }

    /// Only stop and cancel travel through the command bus.
    pub fn is_bus_command(&self) -> bool {
        matches!(self, OpCommand::Stop | OpCommand::Cancel)
    }
}

impl fmt::Display for OpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpCommand {
    type Err = JobServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop" => Ok(OpCommand::Stop),
            "cancel" => Ok(OpCommand::Cancel),
            "retry" => Ok(OpCommand::Retry),
            other => Err(JobServiceError::Validation(format!("unknown command '{}'", other))),
        }
    }
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod tests;
