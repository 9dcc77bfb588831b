//! Response payloads carried in `Response::data`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{SessionRecord, TransitionRecord};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartResult {
    pub id: String,
    pub session: SessionRecord,
}

/// Reply to `stop` and `restart`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionResult {
    pub session: SessionRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListResult {
    pub sessions: Vec<SessionRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusResult {
    pub session: SessionRecord,
    pub transitions: Vec<TransitionRecord>,
}

/// One frame of a `logs` stream. The last frame of a stream has `eof` set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogChunk {
    pub lines: Vec<String>,
    #[serde(default)]
    pub eof: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachResult {
    pub attached: bool,
    pub id: String,
    pub pid: u32,
    pub log_path: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionCounts {
    pub total: usize,
    pub active: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PingResult {
    pub ok: bool,
    pub pid: u32,
    pub version: String,
    pub protocol_version: u32,
    pub uptime_secs: u64,
    pub sessions: SessionCounts,
}

/// Current device claims, keyed by device path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DevicesResult {
    pub devices: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShutdownResult {
    pub shutting_down: bool,
    pub stop_sessions: bool,
}
