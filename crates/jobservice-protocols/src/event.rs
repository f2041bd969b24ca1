//! Cross-replica bus events and webhook payloads.

use serde::{Deserialize, Serialize};

use crate::error::JobServiceResult;
use crate::policy::Policy;
use crate::stats::JobStats;
use crate::status::{OpCommand, Status};

pub const EVENT_SCHEDULE: &str = "schedule";
pub const EVENT_UNSCHEDULE: &str = "unschedule";
pub const EVENT_REGISTER_HOOK: &str = "register_hook";
pub const EVENT_FIRE_COMMAND: &str = "fire_command";
pub const EVENT_PING: &str = "ping";

/// Hook registration shared with peer replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookData {
    pub job_id: String,
    pub hook_url: String,
}

/// Message published on the notification channel.
///
/// Encoded as `{"Event": <name>, "Data": <payload>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Event", content = "Data")]
pub enum BusEvent {
    #[serde(rename = "schedule")]
    Schedule(Policy),
    #[serde(rename = "unschedule")]
    UnSchedule(Policy),
    #[serde(rename = "register_hook")]
    RegisterHook(HookData),
    /// `[job_id, command]`
    #[serde(rename = "fire_command")]
    FireCommand(String, OpCommand),
    /// Keep-alive token echoed back to the subscriber that sent it.
    #[serde(rename = "ping")]
    Ping(String),
}

impl BusEvent {
    /// Event name used as the dispatch key.
    pub fn name(&self) -> &'static str {
        match self {
            BusEvent::Schedule(_) => EVENT_SCHEDULE,
            BusEvent::UnSchedule(_) => EVENT_UNSCHEDULE,
            BusEvent::RegisterHook(_) => EVENT_REGISTER_HOOK,
            BusEvent::FireCommand(..) => EVENT_FIRE_COMMAND,
            BusEvent::Ping(_) => EVENT_PING,
        }
    }

    pub fn encode(&self) -> JobServiceResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> JobServiceResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Body posted to a status hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub job_id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_in: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JobStats>,
}
