//! Durable per-job statistics record.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::job::Parameters;
use crate::status::{JobKind, Status};
use crate::utils::{now_epoch, ref_link};

pub const FIELD_ID: &str = "id";
pub const FIELD_NAME: &str = "name";
pub const FIELD_KIND: &str = "kind";
pub const FIELD_UNIQUE: &str = "unique";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_REF_LINK: &str = "ref_link";
pub const FIELD_ENQUEUE_TIME: &str = "enqueue_time";
pub const FIELD_UPDATE_TIME: &str = "update_time";
pub const FIELD_RUN_AT: &str = "run_at";
pub const FIELD_CHECK_IN: &str = "check_in";
pub const FIELD_CHECK_IN_AT: &str = "check_in_at";
pub const FIELD_DIE_AT: &str = "die_at";
pub const FIELD_CRON_SPEC: &str = "cron_spec";
pub const FIELD_STATUS_HOOK: &str = "status_hook";
pub const FIELD_UPSTREAM_JOB_ID: &str = "upstream_job_id";
pub const FIELD_MULTIPLE_EXECUTIONS: &str = "multiple_executions";
pub const FIELD_PARAMETERS: &str = "parameters";
pub const FIELD_NUMERIC_POLICY_ID: &str = "numeric_policy_id";

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// Statistics of one job, persisted as a hash under `job_stats:<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct JobStats {
    pub job_id: String,
    pub job_name: String,
    pub job_kind: JobKind,
    pub is_unique: bool,
    pub status: Status,
    pub ref_link: String,
    pub enqueue_time: i64,
    pub update_time: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub run_at: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub check_in: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub check_in_at: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub die_at: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cron_spec: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub web_hook_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub upstream_job_id: String,
    #[serde(default)]
    pub is_multiple_executions: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub executions: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: Parameters,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub numeric_policy_id: i64,
}

impl JobStats {
    /// New record in `Pending` state stamped with the current time.
    pub fn new(job_id: impl Into<String>, job_name: impl Into<String>, job_kind: JobKind) -> Self {
        let job_id = job_id.into();
        let now = now_epoch();
        Self {
            ref_link: ref_link(&job_id),
            job_id,
            job_name: job_name.into(),
            job_kind,
            enqueue_time: now,
            update_time: now,
            ..Default::default()
        }
    }

    /// Hash fields written on save.
    ///
    /// Optional fields are only written when set so a save never erases a
    /// check-in, death mark or hook registered earlier.
    pub fn to_hash_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            (FIELD_ID.to_string(), self.job_id.clone()),
            (FIELD_NAME.to_string(), self.job_name.clone()),
            (FIELD_KIND.to_string(), self.job_kind.to_string()),
            (FIELD_UNIQUE.to_string(), self.is_unique.to_string()),
            (FIELD_STATUS.to_string(), self.status.to_string()),
            (FIELD_REF_LINK.to_string(), self.ref_link.clone()),
            (FIELD_ENQUEUE_TIME.to_string(), self.enqueue_time.to_string()),
            (FIELD_UPDATE_TIME.to_string(), self.update_time.to_string()),
            (FIELD_RUN_AT.to_string(), self.run_at.to_string()),
            (FIELD_CRON_SPEC.to_string(), self.cron_spec.clone()),
            (
                FIELD_MULTIPLE_EXECUTIONS.to_string(),
                self.is_multiple_executions.to_string(),
            ),
        ];

        if self.check_in_at > 0 && !self.check_in.is_empty() {
            fields.push((FIELD_CHECK_IN.to_string(), self.check_in.clone()));
            fields.push((FIELD_CHECK_IN_AT.to_string(), self.check_in_at.to_string()));
        }
        if self.die_at > 0 {
            fields.push((FIELD_DIE_AT.to_string(), self.die_at.to_string()));
        }
        if !self.web_hook_url.is_empty() {
            fields.push((FIELD_STATUS_HOOK.to_string(), self.web_hook_url.clone()));
        }
        if !self.upstream_job_id.is_empty() {
            fields.push((FIELD_UPSTREAM_JOB_ID.to_string(), self.upstream_job_id.clone()));
        }
        if !self.parameters.is_empty() {
            // Parameters are a BTreeMap of JSON values; encoding cannot fail.
            if let Ok(raw) = serde_json::to_string(&self.parameters) {
                fields.push((FIELD_PARAMETERS.to_string(), raw));
            }
        }
        if self.numeric_policy_id != 0 {
            fields.push((
                FIELD_NUMERIC_POLICY_ID.to_string(),
                self.numeric_policy_id.to_string(),
            ));
        }

        fields
    }

    /// Rebuild a record from its hash. Unknown or malformed fields are ignored.
    pub fn from_hash(job_id: &str, hash: &HashMap<String, String>) -> Self {
        let int = |field: &str| -> i64 {
            hash.get(field)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or_default()
        };
        let flag = |field: &str| -> bool {
            hash.get(field)
                .and_then(|v| v.parse::<bool>().ok())
                .unwrap_or_default()
        };
        let text = |field: &str| -> String { hash.get(field).cloned().unwrap_or_default() };

        Self {
            job_id: job_id.to_string(),
            job_name: text(FIELD_NAME),
            job_kind: hash
                .get(FIELD_KIND)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            is_unique: flag(FIELD_UNIQUE),
            status: hash
                .get(FIELD_STATUS)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            ref_link: hash
                .get(FIELD_REF_LINK)
                .cloned()
                .unwrap_or_else(|| ref_link(job_id)),
            enqueue_time: int(FIELD_ENQUEUE_TIME),
            update_time: int(FIELD_UPDATE_TIME),
            run_at: int(FIELD_RUN_AT),
            check_in: text(FIELD_CHECK_IN),
            check_in_at: int(FIELD_CHECK_IN_AT),
            die_at: int(FIELD_DIE_AT),
            cron_spec: text(FIELD_CRON_SPEC),
            web_hook_url: text(FIELD_STATUS_HOOK),
            upstream_job_id: text(FIELD_UPSTREAM_JOB_ID),
            is_multiple_executions: flag(FIELD_MULTIPLE_EXECUTIONS),
            executions: Vec::new(),
            parameters: hash
                .get(FIELD_PARAMETERS)
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or_default(),
            numeric_policy_id: int(FIELD_NUMERIC_POLICY_ID),
        }
    }
}

#[cfg(test)]
#[path = "stats_tests.rs"]
mod tests;
