//! Configuration validation.

use crate::error::ConfigError;
use crate::schema::{Backend, Config};

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Validation result.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// First error as a [`ConfigError`], if any.
    pub fn into_result(self) -> Result<Vec<ValidationWarning>, ConfigError> {
        match self.errors.into_iter().next() {
            Some(err) => Err(ConfigError::InvalidValue {
                field: err.path,
                message: err.message,
            }),
            None => Ok(self.warnings),
        }
    }
}

/// A validation error.
#[derive(Debug)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A validation warning.
#[derive(Debug)]
pub struct ValidationWarning {
    pub path: String,
    pub message: String,
}

impl ValidationWarning {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration.
    pub fn validate(config: &Config) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_worker_pool(config, &mut result);
        Self::validate_job_logger(config, &mut result);
        Self::validate_logger(config, &mut result);

        result
    }

    fn validate_worker_pool(config: &Config, result: &mut ValidationResult) {
        let pool = &config.worker_pool;

        if pool.workers == 0 {
            result.add_error(ValidationError::new(
                "worker_pool.workers",
                "workers must be greater than 0",
            ));
        }

        if pool.workers > 1000 {
            result.add_warning(ValidationWarning::new(
                "worker_pool.workers",
                "workers is very high (>1000), each worker holds a KV connection slot",
            ));
        }

        if pool.redis.namespace.trim().is_empty() {
            result.add_error(ValidationError::new(
                "worker_pool.redis.namespace",
                "namespace cannot be empty",
            ));
        }

        match pool.backend {
            Backend::Redis => {
                let url = &pool.redis.url;
                if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                    result.add_error(ValidationError::new(
                        "worker_pool.redis.url",
                        "url must start with redis:// or rediss://",
                    ));
                }
            }
            Backend::Memory => {
                result.add_warning(ValidationWarning::new(
                    "worker_pool.backend",
                    "memory backend keeps all state in process, replicas will not share jobs",
                ));
            }
        }
    }

    fn validate_job_logger(config: &Config, result: &mut ValidationResult) {
        if config.job_logger.base_dir.is_empty() {
            result.add_error(ValidationError::new(
                "job_logger.base_dir",
                "base_dir cannot be empty",
            ));
        }

        if !LEVELS.contains(&config.job_logger.level.to_lowercase().as_str()) {
            result.add_error(ValidationError::new(
                "job_logger.level",
                format!(
                    "Unknown level '{}', valid values: {:?}",
                    config.job_logger.level, LEVELS
                ),
            ));
        }

        if config.job_logger.sweeper_duration_days == 0 {
            result.add_warning(ValidationWarning::new(
                "job_logger.sweeper_duration_days",
                "sweeper_duration_days is 0, job logs will never be swept",
            ));
        }
    }

    fn validate_logger(config: &Config, result: &mut ValidationResult) {
        if !LEVELS.contains(&config.logger.level.to_lowercase().as_str()) {
            result.add_error(ValidationError::new(
                "logger.level",
                format!("Unknown level '{}', valid values: {:?}", config.logger.level, LEVELS),
            ));
        }
    }
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod tests;
