//! Configuration schema definitions.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub worker_pool: WorkerPoolConfig,

    #[serde(default)]
    pub job_logger: JobLoggerConfig,

    #[serde(default)]
    pub logger: LoggerConfig,
}

/// KV backend behind the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Redis,
    /// In-process store. Single replica only.
    Memory,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub backend: Backend,

    #[serde(default)]
    pub redis: RedisConfig,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            backend: Backend::default(),
            redis: RedisConfig::default(),
        }
    }
}

fn default_workers() -> usize {
    10
}

/// Redis connection and tenant namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix of every persistent key.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            namespace: default_namespace(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_namespace() -> String {
    "jobservice".to_string()
}

/// Per-job log files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLoggerConfig {
    #[serde(default = "default_job_log_dir")]
    pub base_dir: String,

    #[serde(default = "default_level")]
    pub level: String,

    /// Job log files older than this are swept.
    #[serde(default = "default_sweeper_duration_days")]
    pub sweeper_duration_days: u64,
}

impl Default for JobLoggerConfig {
    fn default() -> Self {
        Self {
            base_dir: default_job_log_dir(),
            level: default_level(),
            sweeper_duration_days: default_sweeper_duration_days(),
        }
    }
}

fn default_job_log_dir() -> String {
    "/var/log/jobs".to_string()
}

fn default_sweeper_duration_days() -> u64 {
    1
}

/// Service log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default = "default_log_dir")]
    pub dir: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            dir: default_log_dir(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}
