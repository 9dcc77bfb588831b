//! Session Store contract.
//!
//! The manager is the only caller. Records are created once by `put` and
//! afterwards only move through `update_status`; each mutation also appends
//! a row to the session's transition history.

use camstream_protocol::{SessionRecord, SessionStatus, TransitionRecord};

use crate::error::StoreError;

pub trait SessionStore: Send + Sync {
    /// Inserts a new record. Fails with `StoreError::Duplicate` if the id exists.
    fn put(&self, record: &SessionRecord) -> Result<(), StoreError>;

    fn get(&self, id: &str) -> Result<Option<SessionRecord>, StoreError>;

    /// All records, oldest first.
    fn list(&self) -> Result<Vec<SessionRecord>, StoreError>;

    /// Applies a status transition and returns the updated record.
    fn update_status(&self, id: &str, update: &StatusUpdate)
        -> Result<SessionRecord, StoreError>;

    fn transitions(&self, id: &str) -> Result<Vec<TransitionRecord>, StoreError>;
}

/// One status transition.
///
/// `pid`, `proc_started`, `exit_code`, `stopped_at` and `last_error` are
/// written as given. `started_at` is only written when `Some`, so a stop
/// keeps the time of the launch it ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub proc_started: Option<u64>,
    pub exit_code: Option<i32>,
    pub started_at: Option<String>,
    pub stopped_at: Option<String>,
    pub last_error: Option<String>,
    pub restarted: bool,
}

impl StatusUpdate {
    fn bare(status: SessionStatus) -> Self {
        Self {
            status,
            pid: None,
            proc_started: None,
            exit_code: None,
            started_at: None,
            stopped_at: None,
            last_error: None,
            restarted: false,
        }
    }

    pub fn relaunching() -> Self {
        Self {
            restarted: true,
            ..Self::bare(SessionStatus::Starting)
        }
    }

    pub fn running(pid: u32, proc_started: Option<u64>, started_at: String) -> Self {
        Self {
            pid: Some(pid),
            proc_started,
            started_at: Some(started_at),
            ..Self::bare(SessionStatus::Running)
        }
    }

    pub fn stopping(pid: u32, proc_started: Option<u64>) -> Self {
        Self {
            pid: Some(pid),
            proc_started,
            ..Self::bare(SessionStatus::Stopping)
        }
    }

    pub fn stopped(exit_code: Option<i32>, stopped_at: String) -> Self {
        Self {
            exit_code,
            stopped_at: Some(stopped_at),
            ..Self::bare(SessionStatus::Stopped)
        }
    }

    pub fn crashed(exit_code: Option<i32>, reason: impl Into<String>, stopped_at: String) -> Self {
        Self {
            exit_code,
            stopped_at: Some(stopped_at),
            last_error: Some(reason.into()),
            ..Self::bare(SessionStatus::Crashed)
        }
    }

    /// Short description stored with the transition history row.
    pub fn detail(&self) -> Option<String> {
        if let Some(error) = &self.last_error {
            return Some(error.clone());
        }
        match (self.status, self.exit_code) {
            (SessionStatus::Stopped, Some(code)) => Some(format!("exit code {}", code)),
            (SessionStatus::Starting, _) if self.restarted => Some("restart".to_string()),
            _ => None,
        }
    }
}
