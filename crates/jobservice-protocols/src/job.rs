//! Queue entries exchanged through the KV-backed queues.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::JobServiceResult;
use crate::utils::{make_identifier, now_epoch};

/// Free-form job parameters.
///
/// Ordered so that the serialized form of equal parameter sets is identical.
pub type Parameters = BTreeMap<String, serde_json::Value>;

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

/// A job as stored in the immediate, delayed, retry and dead queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    /// Registered handler name.
    pub name: String,
    /// Job id. For periodic triggers this is the policy id.
    pub id: String,
    /// Enqueue epoch. For periodic triggers this is the firing epoch.
    #[serde(rename = "t")]
    pub enqueued_at: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: Parameters,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    /// Materialized from a periodic policy.
    #[serde(default, skip_serializing_if = "is_false")]
    pub periodic: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub fails: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub failed_at: i64,
}

impl QueuedJob {
    /// Create a job with a fresh id enqueued now.
    pub fn new(name: impl Into<String>, args: Parameters) -> Self {
        Self {
            name: name.into(),
            id: make_identifier(),
            enqueued_at: now_epoch(),
            args,
            unique: false,
            periodic: false,
            fails: 0,
            err: None,
            failed_at: 0,
        }
    }

    /// Trigger of a periodic policy at `epoch`.
    ///
    /// Equal inputs always produce an identical serialized form.
    pub fn periodic_trigger(policy_id: &str, name: &str, args: Parameters, epoch: i64) -> Self {
        Self {
            name: name.to_string(),
            id: policy_id.to_string(),
            enqueued_at: epoch,
            args,
            unique: false,
            periodic: true,
            fails: 0,
            err: None,
            failed_at: 0,
        }
    }

    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn encode(&self) -> JobServiceResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> JobServiceResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
