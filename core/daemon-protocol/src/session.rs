use serde::{Deserialize, Serialize};

use crate::LaunchSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl SessionStatus {
    /// Terminal sessions no longer hold their device.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Crashed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Crashed => "crashed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "starting" => Some(SessionStatus::Starting),
            "running" => Some(SessionStatus::Running),
            "stopping" => Some(SessionStatus::Stopping),
            "stopped" => Some(SessionStatus::Stopped),
            "crashed" => Some(SessionStatus::Crashed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub alias: String,
    pub device: String,
    pub launch_spec: LaunchSpec,
    /// Program and arguments, fixed when the session is created.
    pub argv: Vec<String>,
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub proc_started: Option<u64>,
    pub log_path: String,
    pub exit_code: Option<i32>,
    pub last_error: Option<String>,
    pub restart_count: u32,
    pub created_at: String,
    pub started_at: Option<String>,
    pub stopped_at: Option<String>,
    pub updated_at: String,
}

/// One entry of a session's append-only status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub seq: i64,
    pub session_id: String,
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub detail: Option<String>,
    pub recorded_at: String,
}
