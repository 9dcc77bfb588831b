//! IPC protocol types and validation for camstream-daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests and decode session records.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod launch;
mod payloads;
mod session;

pub use launch::{FrameSize, LaunchSpec, StartParams};
pub use payloads::{
    AttachResult, DevicesResult, ListResult, LogChunk, PingResult, SessionCounts, SessionResult,
    ShutdownResult, StartResult, StatusResult,
};
pub use session::{SessionRecord, SessionStatus, TransitionRecord};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const DEFAULT_LOG_TAIL_LINES: usize = 100;
pub const MAX_LOG_TAIL_LINES: usize = 10_000;

pub const ERROR_INVALID_JSON: &str = "invalid_json";
pub const ERROR_INVALID_PARAMS: &str = "invalid_params";
pub const ERROR_VALIDATION: &str = "validation_error";
pub const ERROR_CONFLICT: &str = "conflict";
pub const ERROR_NOT_FOUND: &str = "not_found";
pub const ERROR_ALREADY_STOPPED: &str = "already_stopped";
pub const ERROR_LAUNCH_FAILED: &str = "launch_failed";
pub const ERROR_STOP_TIMEOUT: &str = "stop_timeout";
pub const ERROR_NOT_RUNNING: &str = "not_running";
pub const ERROR_STORE: &str = "store_error";
pub const ERROR_PROTOCOL_MISMATCH: &str = "protocol_mismatch";
pub const ERROR_READ_TIMEOUT: &str = "read_timeout";
pub const ERROR_READ: &str = "read_error";
pub const ERROR_REQUEST_TOO_LARGE: &str = "request_too_large";
pub const ERROR_EMPTY_REQUEST: &str = "empty_request";
pub const ERROR_TOO_MANY_CONNECTIONS: &str = "too_many_connections";
pub const ERROR_INTERNAL: &str = "internal_error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    Start,
    Stop,
    Restart,
    List,
    Status,
    Logs,
    Attach,
    Ping,
    Devices,
    Shutdown,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: None,
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    /// Machine-readable context, e.g. the holder of a conflicting device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Payload for every command that addresses a single session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SessionParams {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LogsParams {
    pub id: String,
    #[serde(default)]
    pub tail: Option<usize>,
    #[serde(default)]
    pub follow: bool,
}

impl LogsParams {
    pub fn tail_lines(&self) -> usize {
        self.tail
            .unwrap_or(DEFAULT_LOG_TAIL_LINES)
            .min(MAX_LOG_TAIL_LINES)
    }
}

/// Decodes a request payload into a typed params struct.
pub fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, ErrorInfo> {
    let params = params.ok_or_else(|| ErrorInfo::new(ERROR_INVALID_PARAMS, "params are required"))?;
    if !params.is_object() {
        return Err(ErrorInfo::new(
            ERROR_INVALID_PARAMS,
            "params must be an object",
        ));
    }
    serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            ERROR_INVALID_PARAMS,
            format!("params are invalid: {}", err),
        )
    })
}

pub fn parse_session_params(params: Option<Value>) -> Result<SessionParams, ErrorInfo> {
    let parsed: SessionParams = parse_params(params)?;
    require_session_id(&parsed.id)?;
    Ok(parsed)
}

pub fn parse_logs_params(params: Option<Value>) -> Result<LogsParams, ErrorInfo> {
    let parsed: LogsParams = parse_params(params)?;
    require_session_id(&parsed.id)?;
    Ok(parsed)
}

fn require_session_id(id: &str) -> Result<(), ErrorInfo> {
    if id.trim().is_empty() {
        return Err(ErrorInfo::new(ERROR_INVALID_PARAMS, "id is required"));
    }
    if id.len() > 128 {
        return Err(ErrorInfo::new(
            ERROR_INVALID_PARAMS,
            "id must be 128 characters or fewer",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trips_method_names() {
        let raw = r#"{"protocol_version":1,"method":"restart","params":{"id":"ses-1"}}"#;
        let request: Request = serde_json::from_str(raw).expect("parse request");
        assert_eq!(request.method, Method::Restart);
        assert!(request.id.is_none());
    }

    #[test]
    fn rejects_unknown_request_fields() {
        let raw = r#"{"protocol_version":1,"method":"ping","extra":true}"#;
        assert!(serde_json::from_str::<Request>(raw).is_err());
    }

    #[test]
    fn rejects_unknown_method() {
        let raw = r#"{"protocol_version":1,"method":"purge"}"#;
        assert!(serde_json::from_str::<Request>(raw).is_err());
    }

    #[test]
    fn session_params_require_id() {
        let err = parse_session_params(Some(json!({"id": "  "}))).unwrap_err();
        assert_eq!(err.code, ERROR_INVALID_PARAMS);

        let err = parse_session_params(None).unwrap_err();
        assert_eq!(err.code, ERROR_INVALID_PARAMS);

        let err = parse_session_params(Some(json!(["ses-1"]))).unwrap_err();
        assert_eq!(err.message, "params must be an object");
    }

    #[test]
    fn logs_params_cap_tail() {
        let parsed = parse_logs_params(Some(json!({"id": "ses-1", "tail": 1_000_000})))
            .expect("parse logs params");
        assert_eq!(parsed.tail_lines(), MAX_LOG_TAIL_LINES);
        assert!(!parsed.follow);

        let parsed = parse_logs_params(Some(json!({"id": "ses-1"}))).expect("defaults");
        assert_eq!(parsed.tail_lines(), DEFAULT_LOG_TAIL_LINES);
    }

    #[test]
    fn error_info_skips_empty_data() {
        let value = serde_json::to_value(ErrorInfo::new(ERROR_NOT_FOUND, "missing")).unwrap();
        assert!(value.get("data").is_none());

        let value = serde_json::to_value(
            ErrorInfo::new(ERROR_CONFLICT, "busy").with_data(json!({"holder": "ses-1"})),
        )
        .unwrap();
        assert_eq!(value["data"]["holder"], "ses-1");
    }
}
