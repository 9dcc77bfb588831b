//! Error types for the control plane.
//!
//! `ControlError` is what the manager hands back to the server; every variant
//! maps onto one protocol error code so clients can branch on it.

use camstream_protocol::{
    ErrorInfo, ERROR_ALREADY_STOPPED, ERROR_CONFLICT, ERROR_INTERNAL, ERROR_LAUNCH_FAILED,
    ERROR_NOT_FOUND, ERROR_NOT_RUNNING, ERROR_STOP_TIMEOUT, ERROR_STORE,
};
use serde_json::json;
use std::path::PathBuf;

use crate::locks::LockCorruption;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store I/O failed: {context}: {source}")]
    Sqlite {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Store payload could not be encoded: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Session already exists: {0}")]
    Duplicate(String),

    #[error("Session not found: {0}")]
    Missing(String),

    #[error("Corrupt session row {id}: {details}")]
    Corrupt { id: String, details: String },

    #[error("Failed to prepare state directory {path}: {source}")]
    Dir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn sqlite(context: &str, source: rusqlite::Error) -> Self {
        StoreError::Sqlite {
            context: context.to_string(),
            source,
        }
    }

    pub fn json(context: &str, source: serde_json::Error) -> Self {
        StoreError::Json {
            context: context.to_string(),
            source,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to open session log {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Encoder argv is empty")]
    EmptyArgv,

    #[error("Failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Process handle {0} is not known to the supervisor")]
    UnknownHandle(u64),

    #[error("Process has no interactive input channel")]
    NoInput,

    #[error("Failed to write to process input: {0}")]
    Input(#[source] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("{0}")]
    Validation(ErrorInfo),

    #[error("Device {device} is held by session {holder}")]
    Conflict { device: String, holder: String },

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session {0} is already stopped")]
    AlreadyStopped(String),

    #[error("Session {0} has no live process")]
    NotRunning(String),

    #[error("Session {id} failed to launch: {reason}")]
    LaunchFailed {
        id: String,
        reason: String,
        log_tail: Vec<String>,
    },

    #[error("Session {id} did not exit within {waited_ms}ms of being killed")]
    StopTimeout { id: String, waited_ms: u64 },

    #[error("Failed to read session log {path}: {source}")]
    LogRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Device lock table is inconsistent: {}", describe_corruption(.0))]
    Corruption(Vec<LockCorruption>),
}

fn describe_corruption(corrupt: &[LockCorruption]) -> String {
    corrupt
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ControlError {
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            ControlError::Validation(info) => info.clone(),
            ControlError::Conflict { device, holder } => {
                ErrorInfo::new(ERROR_CONFLICT, self.to_string())
                    .with_data(json!({ "device": device, "holder": holder }))
            }
            ControlError::NotFound(id) => {
                ErrorInfo::new(ERROR_NOT_FOUND, self.to_string()).with_data(json!({ "id": id }))
            }
            ControlError::AlreadyStopped(id) => {
                ErrorInfo::new(ERROR_ALREADY_STOPPED, self.to_string())
                    .with_data(json!({ "id": id }))
            }
            ControlError::NotRunning(id) => {
                ErrorInfo::new(ERROR_NOT_RUNNING, self.to_string()).with_data(json!({ "id": id }))
            }
            ControlError::LaunchFailed { id, log_tail, .. } => {
                ErrorInfo::new(ERROR_LAUNCH_FAILED, self.to_string())
                    .with_data(json!({ "id": id, "log_tail": log_tail }))
            }
            ControlError::StopTimeout { id, .. } => {
                ErrorInfo::new(ERROR_STOP_TIMEOUT, self.to_string())
                    .with_data(json!({ "id": id }))
            }
            ControlError::Store(_) => ErrorInfo::new(ERROR_STORE, self.to_string()),
            ControlError::LogRead { .. } | ControlError::Supervisor(_) => {
                ErrorInfo::new(ERROR_INTERNAL, self.to_string())
            }
        }
    }
}
