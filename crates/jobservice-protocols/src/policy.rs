//! Periodic job policies.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::error::{JobServiceError, JobServiceResult};
use crate::job::Parameters;
use crate::utils::is_valid_url;

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// Parse a six-field (seconds first) cron expression.
pub fn parse_cron(spec: &str) -> JobServiceResult<Schedule> {
    Schedule::from_str(spec).map_err(|e| JobServiceError::Cron {
        spec: spec.to_string(),
        message: e.to_string(),
    })
}

/// Every firing of `schedule` inside `[from, from + horizon]`.
pub fn firings_within(schedule: &Schedule, from: DateTime<Utc>, horizon: Duration) -> Vec<DateTime<Utc>> {
    let end = from + horizon;
    // `after` is exclusive; step back one second so a firing at `from` is kept.
    schedule
        .after(&(from - Duration::seconds(1)))
        .take_while(|t| *t <= end)
        .collect()
}

/// A cron-triggered template producing periodic job runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(rename = "policy_id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub job_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub job_params: Parameters,
    pub cron_spec: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub web_hook_url: String,
    /// Sort score in the persistent policy set.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub numeric_id: i64,
}

impl Policy {
    pub fn new(
        id: impl Into<String>,
        job_name: impl Into<String>,
        job_params: Parameters,
        cron_spec: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            job_name: job_name.into(),
            job_params,
            cron_spec: cron_spec.into(),
            web_hook_url: String::new(),
            numeric_id: 0,
        }
    }

    pub fn with_web_hook(mut self, url: impl Into<String>) -> Self {
        self.web_hook_url = url.into();
        self
    }

    /// Check id, job name, cron expression and webhook URL.
    pub fn validate(&self) -> JobServiceResult<()> {
        if self.id.is_empty() {
            return Err(JobServiceError::Validation("empty policy id".to_string()));
        }
        if self.job_name.is_empty() {
            return Err(JobServiceError::Validation("empty job name".to_string()));
        }
        parse_cron(&self.cron_spec)?;
        if !self.web_hook_url.is_empty() && !is_valid_url(&self.web_hook_url) {
            return Err(JobServiceError::Validation(format!(
                "invalid web hook url '{}'",
                self.web_hook_url
            )));
        }

        Ok(())
    }

    pub fn schedule(&self) -> JobServiceResult<Schedule> {
        parse_cron(&self.cron_spec)
    }

    /// First firing strictly after `after`.
    pub fn next_run(&self, after: DateTime<Utc>) -> JobServiceResult<Option<DateTime<Utc>>> {
        Ok(self.schedule()?.after(&after).next())
    }

    /// Member value for the policy set. Id and numeric id are elided so that
    /// equal (job, parameters, cron, hook) tuples collide.
    pub fn serialize_for_set(&self) -> JobServiceResult<String> {
        let mut stripped = self.clone();
        stripped.id.clear();
        stripped.numeric_id = 0;
        Ok(serde_json::to_string(&stripped)?)
    }

    pub fn deserialize(raw: &str) -> JobServiceResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
