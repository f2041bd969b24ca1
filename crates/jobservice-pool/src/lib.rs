//! # Job Service Pool
//!
//! Runs jobs and exposes the control plane.
//!
//! ## Components
//!
//! - [`BackendQueue`]: immediate, delayed, retry and dead queues over the KV store
//! - [`WorkerPool`]: handler registry, workers, requeuer and heartbeat
//! - [`Reaper`]: requeues jobs of dead pools and fails hung records
//! - [`MessageBus`]: cross-replica events on the notification channel
//! - [`DeDuplicator`]: at most one live instance of a unique job
//! - [`Controller`]: validated job submission and operator actions
//! - [`JobLoggerFactory`]: per-job log files and their retention

pub mod bus;
pub mod config;
pub mod controller;
pub mod dedup;
pub mod logger;
pub mod pool;
pub mod queue;
pub mod reaper;
pub mod registry;
mod runner;

pub use bus::{BusConfig, MessageBus};
pub use config::PoolConfig;
pub use controller::Controller;
pub use dedup::DeDuplicator;
pub use logger::{FileJobLogger, JobLogSweeper, JobLoggerFactory};
pub use pool::{PoolStats, PoolStatus, WorkerPool};
pub use queue::{BackendQueue, ClaimedJob};
pub use reaper::{Reaper, ReaperConfig};
pub use registry::JobRegistry;
