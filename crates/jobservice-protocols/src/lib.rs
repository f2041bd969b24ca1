//! # Job Service Protocols
//!
//! Shared data model and contracts for the distributed job service.
//!
//! ## Contents
//!
//! - Job statistics records and their hash encoding
//! - Job status state machine and job kinds
//! - Queue entries, periodic policies and control plane requests
//! - Cross-replica bus events and webhook payloads
//! - The `Job` handler trait and the `JobContext` injected into running jobs

pub mod error;
pub mod event;
pub mod handler;
pub mod job;
pub mod logger;
pub mod policy;
pub mod request;
pub mod stats;
pub mod status;
pub mod utils;

pub use error::{JobError, JobServiceError, JobServiceResult};
pub use event::{BusEvent, HookData, StatusChange};
pub use handler::{CheckInFn, Job, JobContext, LaunchJobFn, OpCommandFn, DEFAULT_MAX_FAILS};
pub use job::{Parameters, QueuedJob};
pub use logger::{JobLogger, MemoryJobLogger};
pub use policy::Policy;
pub use request::{JobActionRequest, JobData, JobMetadata, JobRequest};
pub use stats::JobStats;
pub use status::{JobKind, OpCommand, Status};
