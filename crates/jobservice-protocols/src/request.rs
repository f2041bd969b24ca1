//! Control plane request formats.

use serde::{Deserialize, Serialize};

use crate::error::JobServiceResult;
use crate::job::Parameters;
use crate::status::{JobKind, OpCommand};

/// Job submission request.
///
/// ```json
/// { "job": { "name": "DEMO", "parameters": {}, "metadata": { "kind": "Generic" } } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job: JobData,
}

/// The job part of a submission request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobData {
    pub name: String,
    #[serde(default)]
    pub parameters: Parameters,
    pub metadata: JobMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_hook: Option<String>,
}

/// How a submitted job should be run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct JobMetadata {
    pub kind: JobKind,
    /// Seconds to wait before a Scheduled job runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_spec: Option<String>,
    #[serde(default)]
    pub unique: bool,
}

impl JobRequest {
    /// Request for a Generic job.
    pub fn generic(name: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            job: JobData {
                name: name.into(),
                parameters,
                metadata: JobMetadata::default(),
                status_hook: None,
            },
        }
    }

    pub fn with_status_hook(mut self, url: impl Into<String>) -> Self {
        self.job.status_hook = Some(url.into());
        self
    }

    pub fn with_metadata(mut self, metadata: JobMetadata) -> Self {
        self.job.metadata = metadata;
        self
    }
}

/// Operator action on an existing job: `{ "action": "stop" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobActionRequest {
    pub action: String,
}

impl JobActionRequest {
    pub fn command(&self) -> JobServiceResult<OpCommand> {
        self.action.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scheduled_request() {
        let raw = r#"{
            "job": {
                "name": "DEMO",
                "parameters": {"image": "library/busybox", "count": 3},
                "metadata": {"kind": "Scheduled", "schedule_delay": 90, "unique": true},
                "status_hook": "http://x/hook"
            }
        }"#;
        let req: JobRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.job.name, "DEMO");
        assert_eq!(req.job.metadata.kind, JobKind::Scheduled);
        assert_eq!(req.job.metadata.schedule_delay, Some(90));
        assert!(req.job.metadata.unique);
        assert_eq!(req.job.parameters.len(), 2);
        assert_eq!(req.job.status_hook.as_deref(), Some("http://x/hook"));
    }

    #[test]
    fn test_parse_minimal_request() {
        let raw = r#"{"job": {"name": "gc", "metadata": {"kind": "Periodic", "cron_spec": "0 0 * * * *"}}}"#;
        let req: JobRequest = serde_json::from_str(raw).unwrap();
        assert!(req.job.parameters.is_empty());
        assert_eq!(req.job.metadata.cron_spec.as_deref(), Some("0 0 * * * *"));
        assert!(!req.job.metadata.unique);
    }

    #[test]
    fn test_action_request() {
        let action: JobActionRequest = serde_json::from_str(r#"{"action":"cancel"}"#).unwrap();
        assert_eq!(action.command().unwrap(), OpCommand::Cancel);

        let action = JobActionRequest { action: "pause".to_string() };
        assert!(action.command().is_err());
    }
}
