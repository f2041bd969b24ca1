//! # Job Service OPM
//!
//! Operation management: the single-writer stats manager and the
//! subsystems it owns.
//!
//! - [`JobStatsManager`]: durable job records, status reporting, check-ins
//! - [`HookClient`] / [`HookStore`]: webhook delivery and hook URL cache
//! - [`OpCommandStore`]: stop/cancel commands awaiting a poll

mod hook_client;
mod hook_store;
mod op_commands;
mod stats_manager;

pub use hook_client::{HookClient, HookClientConfig};
pub use hook_store::HookStore;
pub use op_commands::{COMMAND_VALID_SECS, OpCommandStore};
pub use stats_manager::{JobStatsManager, StatsManagerConfig};
