//! Per-job log sink.

use std::fmt;

use parking_lot::Mutex;
use tracing::Level;

/// Log sink handed to a running job.
///
/// Lines written here belong to one job execution and are readable through
/// the controller, independent of the service log.
pub trait JobLogger: Send + Sync {
    fn log(&self, level: Level, message: &str);

    fn debug(&self, message: &str) {
        self.log(Level::DEBUG, message);
    }

    fn info(&self, message: &str) {
        self.log(Level::INFO, message);
    }

    fn warn(&self, message: &str) {
        self.log(Level::WARN, message);
    }

    fn error(&self, message: &str) {
        self.log(Level::ERROR, message);
    }
}

/// In-memory job logger, used by tests and detached contexts.
#[derive(Default)]
pub struct MemoryJobLogger {
    lines: Mutex<Vec<String>>,
}

impl MemoryJobLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn contents(&self) -> String {
        self.lines.lock().join("\n")
    }
}

impl fmt::Debug for MemoryJobLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryJobLogger")
            .field("lines", &self.lines.lock().len())
            .finish()
    }
}

impl JobLogger for MemoryJobLogger {
    fn log(&self, level: Level, message: &str) {
        self.lines.lock().push(format!("[{}] {}", level, message));
    }
}
