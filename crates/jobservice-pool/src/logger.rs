//! Per-job log files.
//!
//! Each execution writes to `<base_dir>/<job_id>.log`. The sweeper removes
//! files that have not been written for the retention period.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{SecondsFormat, Utc};
use jobservice_protocols::{JobLogger, JobServiceError, JobServiceResult};
use parking_lot::Mutex;
use tokio::fs::OpenOptions;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, info, warn};

const LOG_EXTENSION: &str = "log";
const SWEEP_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Appends timestamped lines to one job's log file.
pub struct FileJobLogger {
    path: PathBuf,
    level: Level,
    file: Mutex<File>,
}

impl FileJobLogger {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JobLogger for FileJobLogger {
    fn log(&self, level: Level, message: &str) {
        if level > self.level {
            return;
        }
        let line = format!(
            "{} [{}]: {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level,
            message
        );
        if let Err(e) = self.file.lock().write_all(line.as_bytes()) {
            warn!("Failed to write job log {:?}: {}", self.path, e);
        }
    }
}

/// Creates and reads job log files under one directory.
#[derive(Debug, Clone)]
pub struct JobLoggerFactory {
    base_dir: PathBuf,
    level: Level,
}

impl JobLoggerFactory {
    pub fn new(base_dir: impl Into<PathBuf>, level: Level) -> Self {
        Self {
            base_dir: base_dir.into(),
            level,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn log_path(&self, job_id: &str) -> JobServiceResult<PathBuf> {
        if job_id.is_empty()
            || job_id.contains(['/', '\\'])
            || job_id.starts_with('.')
        {
            return Err(JobServiceError::Validation(format!(
                "invalid job id '{}'",
                job_id
            )));
        }
        Ok(self.base_dir.join(format!("{}.{}", job_id, LOG_EXTENSION)))
    }

    /// Open the log of `job_id` for appending, creating it if needed.
    pub async fn create(&self, job_id: &str) -> JobServiceResult<Arc<FileJobLogger>> {
        let path = self.log_path(job_id)?;
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| io_error(&self.base_dir, e))?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| io_error(&path, e))?
            .into_std()
            .await;

        debug!("Opened job log {:?}", path);
        Ok(Arc::new(FileJobLogger {
            path,
            level: self.level,
            file: Mutex::new(file),
        }))
    }

    /// Full content of the log of `job_id`.
    pub async fn read_log(&self, job_id: &str) -> JobServiceResult<String> {
        let path = self.log_path(job_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(JobServiceError::NotFound(
                format!("log of job '{}'", job_id),
            )),
            Err(e) => Err(io_error(&path, e)),
        }
    }
}

fn io_error(path: &Path, e: std::io::Error) -> JobServiceError {
    JobServiceError::Internal(format!("{}: {}", path.display(), e))
}

/// Deletes job logs older than the retention period.
#[derive(Debug, Clone)]
pub struct JobLogSweeper {
    base_dir: PathBuf,
    retention: Duration,
}

impl JobLogSweeper {
    pub fn new(base_dir: impl Into<PathBuf>, retention_days: u64) -> Self {
        Self {
            base_dir: base_dir.into(),
            retention: Duration::from_secs(retention_days * 24 * 60 * 60),
        }
    }

    /// Sweep once now and then daily until `cancel`.
    pub fn start(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_PERIOD);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.sweep(SystemTime::now()).await {
                            Ok(0) => {}
                            Ok(n) => info!("Swept {} outdated job logs", n),
                            Err(e) => warn!("Job log sweep failed: {}", e),
                        }
                    }
                }
            }
        });
    }

    /// Delete every log last modified before `now - retention`.
    pub async fn sweep(&self, now: SystemTime) -> JobServiceResult<usize> {
        let Some(cutoff) = now.checked_sub(self.retention) else {
            return Ok(0);
        };
        if !self.base_dir.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.base_dir)
            .await
            .map_err(|e| io_error(&self.base_dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(&self.base_dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    warn!("Cannot stat job log {:?}: {}", path, e);
                    continue;
                }
            };
            if modified < cutoff {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Cannot remove job log {:?}: {}", path, e),
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_logger_appends_lines() {
        let dir = TempDir::new().unwrap();
        let factory = JobLoggerFactory::new(dir.path().join("jobs"), Level::INFO);

        let logger = factory.create("J1").await.unwrap();
        logger.info("started");
        logger.debug("hidden");
        logger.error("boom");
        assert_eq!(logger.path(), dir.path().join("jobs").join("J1.log"));

        let content = factory.read_log("J1").await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[INFO]: started"));
        assert!(lines[1].ends_with("[ERROR]: boom"));

        // Reopening keeps what was written.
        factory.create("J1").await.unwrap().warn("again");
        assert_eq!(factory.read_log("J1").await.unwrap().lines().count(), 3);
    }

    #[tokio::test]
    async fn test_read_missing_log() {
        let dir = TempDir::new().unwrap();
        let factory = JobLoggerFactory::new(dir.path(), Level::INFO);
        assert!(factory.read_log("nope").await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_log_path_rejects_traversal() {
        let factory = JobLoggerFactory::new("/var/log/jobs", Level::INFO);
        assert!(factory.log_path("../etc/passwd").is_err());
        assert!(factory.log_path("a/b").is_err());
        assert!(factory.log_path("").is_err());
        assert_eq!(
            factory.log_path("abc").unwrap(),
            PathBuf::from("/var/log/jobs/abc.log")
        );
    }

    #[tokio::test]
    async fn test_sweeper_removes_old_logs_only() {
        let dir = TempDir::new().unwrap();
        let factory = JobLoggerFactory::new(dir.path(), Level::INFO);
        factory.create("old").await.unwrap().info("x");
        factory.create("new").await.unwrap().info("y");
        std::fs::write(dir.path().join("notes.txt"), "keep").unwrap();

        let three_days_ago = SystemTime::now() - Duration::from_secs(3 * 24 * 60 * 60);
        File::options()
            .write(true)
            .open(dir.path().join("old.log"))
            .unwrap()
            .set_modified(three_days_ago)
            .unwrap();

        let sweeper = JobLogSweeper::new(dir.path(), 1);
        assert_eq!(sweeper.sweep(SystemTime::now()).await.unwrap(), 1);
        assert!(!dir.path().join("old.log").exists());
        assert!(dir.path().join("new.log").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_sweeper_without_directory() {
        let dir = TempDir::new().unwrap();
        let sweeper = JobLogSweeper::new(dir.path().join("missing"), 1);
        assert_eq!(sweeper.sweep(SystemTime::now()).await.unwrap(), 0);
    }
}
