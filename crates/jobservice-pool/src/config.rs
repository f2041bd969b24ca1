//! Worker pool configuration.

use std::time::Duration;

use jobservice_opm::StatsManagerConfig;
use jobservice_period::EnqueuerConfig;

use crate::bus::BusConfig;
use crate::reaper::ReaperConfig;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrent workers.
    pub workers: usize,

    /// Idle wait of a worker that found every queue empty.
    pub fetch_interval: Duration,

    /// Period of moving due delayed and retry entries to their queues.
    pub requeue_interval: Duration,

    /// Period of the pool heartbeat.
    pub heartbeat_interval: Duration,

    /// KV ping attempts on start.
    pub ping_attempts: u32,

    /// Base of the backoff between start pings.
    pub ping_backoff: Duration,

    /// Delay before the death mark of a panicked job is recorded.
    pub die_at_delay: Duration,

    pub stats: StatsManagerConfig,
    pub enqueuer: EnqueuerConfig,
    pub bus: BusConfig,
    pub reaper: ReaperConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            fetch_interval: Duration::from_millis(100),
            requeue_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
            ping_attempts: 10,
            ping_backoff: Duration::from_secs(1),
            die_at_delay: Duration::from_secs(2),
            stats: StatsManagerConfig::default(),
            enqueuer: EnqueuerConfig::default(),
            bus: BusConfig::default(),
            reaper: ReaperConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Pool with `workers` workers and default timings.
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }
}
