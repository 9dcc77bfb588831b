//! Launch specification for an encoder session.
//!
//! Everything that ends up in the encoder's argument vector passes through
//! `StartParams::validate` first. Values are never joined into a shell string;
//! the checks below keep them from being read as options by the encoder.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path};
use std::str::FromStr;

use crate::{ErrorInfo, ERROR_VALIDATION};

const MAX_ALIAS_CHARS: usize = 64;
const MAX_STREAM_NAME_CHARS: usize = 64;
const MAX_DEVICE_BYTES: usize = 255;
const MAX_INPUT_FORMAT_CHARS: usize = 32;
const MAX_EXTRA_ARGS: usize = 32;
const MAX_EXTRA_ARG_BYTES: usize = 256;
const FRAME_RATE_RANGE: (u32, u32) = (1, 240);
const WIDTH_RANGE: (u32, u32) = (16, 7680);
const HEIGHT_RANGE: (u32, u32) = (16, 4320);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StartParams {
    pub alias: String,
    pub device: String,
    pub frame_rate: u32,
    pub frame_size: String,
    pub input_format: String,
    #[serde(default)]
    pub stream_name: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// Validated, immutable encoder configuration stored with a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchSpec {
    pub device: String,
    pub frame_rate: u32,
    pub frame_size: FrameSize,
    pub input_format: String,
    pub stream_name: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for FrameSize {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (width, height) = value
            .split_once('x')
            .ok_or_else(|| format!("frame_size must look like WIDTHxHEIGHT, got {:?}", value))?;
        let width: u32 = width
            .parse()
            .map_err(|_| format!("frame_size width is not a number: {:?}", width))?;
        let height: u32 = height
            .parse()
            .map_err(|_| format!("frame_size height is not a number: {:?}", height))?;

        if !in_range(width, WIDTH_RANGE) {
            return Err(format!(
                "frame_size width must be between {} and {}",
                WIDTH_RANGE.0, WIDTH_RANGE.1
            ));
        }
        if !in_range(height, HEIGHT_RANGE) {
            return Err(format!(
                "frame_size height must be between {} and {}",
                HEIGHT_RANGE.0, HEIGHT_RANGE.1
            ));
        }
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for FrameSize {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FrameSize> for String {
    fn from(value: FrameSize) -> Self {
        value.to_string()
    }
}

impl StartParams {
    /// Checks every field and returns the alias plus the launch spec.
    pub fn validate(&self) -> Result<(String, LaunchSpec), ErrorInfo> {
        let alias = self.alias.trim();
        validate_label(alias, "alias", MAX_ALIAS_CHARS)?;
        validate_device(&self.device)?;

        if !in_range(self.frame_rate, FRAME_RATE_RANGE) {
            return Err(invalid(format!(
                "frame_rate must be between {} and {}",
                FRAME_RATE_RANGE.0, FRAME_RATE_RANGE.1
            )));
        }

        let frame_size: FrameSize = self.frame_size.trim().parse().map_err(invalid)?;
        validate_input_format(&self.input_format)?;

        let stream_name = match self.stream_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => alias.to_string(),
        };
        validate_label(&stream_name, "stream_name", MAX_STREAM_NAME_CHARS)?;
        if stream_name.starts_with('-') {
            return Err(invalid("stream_name must not start with '-'"));
        }

        if self.extra_args.len() > MAX_EXTRA_ARGS {
            return Err(invalid(format!(
                "extra_args accepts at most {} entries",
                MAX_EXTRA_ARGS
            )));
        }
        for arg in &self.extra_args {
            if arg.len() > MAX_EXTRA_ARG_BYTES {
                return Err(invalid(format!(
                    "extra_args entries must be {} bytes or fewer",
                    MAX_EXTRA_ARG_BYTES
                )));
            }
            if arg.chars().any(|c| c == '\0' || c == '\n' || c == '\r') {
                return Err(invalid("extra_args entries must not contain NUL or newlines"));
            }
        }

        Ok((
            alias.to_string(),
            LaunchSpec {
                device: self.device.clone(),
                frame_rate: self.frame_rate,
                frame_size,
                input_format: self.input_format.clone(),
                stream_name,
                extra_args: self.extra_args.clone(),
            },
        ))
    }
}

fn validate_label(value: &str, field: &str, max_chars: usize) -> Result<(), ErrorInfo> {
    if value.is_empty() {
        return Err(invalid(format!("{} is required", field)));
    }
    if value.chars().count() > max_chars {
        return Err(invalid(format!(
            "{} must be {} characters or fewer",
            field, max_chars
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(invalid(format!(
            "{} must not contain control characters",
            field
        )));
    }
    Ok(())
}

fn validate_device(device: &str) -> Result<(), ErrorInfo> {
    if device.is_empty() {
        return Err(invalid("device is required"));
    }
    if device.len() > MAX_DEVICE_BYTES {
        return Err(invalid(format!(
            "device must be {} bytes or fewer",
            MAX_DEVICE_BYTES
        )));
    }
    if device
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(invalid(
            "device must not contain whitespace or control characters",
        ));
    }
    if device.starts_with('-') {
        return Err(invalid("device must not start with '-'"));
    }
    let path = Path::new(device);
    if !path.is_absolute() {
        return Err(invalid("device must be an absolute path"));
    }
    if path.components().any(|part| part == Component::ParentDir) {
        return Err(invalid("device must not contain '..'"));
    }
    if device.ends_with('/') {
        return Err(invalid("device must name a file, not a directory"));
    }
    Ok(())
}

fn validate_input_format(format: &str) -> Result<(), ErrorInfo> {
    if format.is_empty() {
        return Err(invalid("input_format is required"));
    }
    if format.len() > MAX_INPUT_FORMAT_CHARS {
        return Err(invalid(format!(
            "input_format must be {} characters or fewer",
            MAX_INPUT_FORMAT_CHARS
        )));
    }
    if !format
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(invalid(
            "input_format may only contain lowercase letters, digits and '_'",
        ));
    }
    Ok(())
}

fn in_range(value: u32, (min, max): (u32, u32)) -> bool {
    value >= min && value <= max
}

fn invalid(message: impl Into<String>) -> ErrorInfo {
    ErrorInfo::new(ERROR_VALIDATION, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_params() -> StartParams {
        StartParams {
            alias: "cam1".to_string(),
            device: "/dev/video0".to_string(),
            frame_rate: 30,
            frame_size: "1280x720".to_string(),
            input_format: "mjpeg".to_string(),
            stream_name: None,
            extra_args: Vec::new(),
        }
    }

    #[test]
    fn validates_minimal_params() {
        let (alias, spec) = base_params().validate().expect("valid params");
        assert_eq!(alias, "cam1");
        assert_eq!(spec.stream_name, "cam1");
        assert_eq!(
            spec.frame_size,
            FrameSize {
                width: 1280,
                height: 720
            }
        );
    }

    #[test]
    fn stream_name_overrides_alias() {
        let mut params = base_params();
        params.stream_name = Some("Studio A".to_string());
        let (_, spec) = params.validate().expect("valid params");
        assert_eq!(spec.stream_name, "Studio A");
    }

    #[test]
    fn rejects_relative_or_option_like_devices() {
        for device in ["video0", "-i", "/dev/../etc/passwd", "/dev/video 0", "", "/dev/"] {
            let mut params = base_params();
            params.device = device.to_string();
            let err = params.validate().unwrap_err();
            assert_eq!(err.code, ERROR_VALIDATION, "device {:?}", device);
        }
    }

    #[test]
    fn rejects_out_of_range_frame_rate() {
        for rate in [0, 241] {
            let mut params = base_params();
            params.frame_rate = rate;
            assert!(params.validate().is_err(), "rate {}", rate);
        }
    }

    #[test]
    fn rejects_bad_frame_sizes() {
        for size in ["1280", "1280x", "x720", "8x8", "99999x720", "1280x720x2", "wide"] {
            let mut params = base_params();
            params.frame_size = size.to_string();
            assert!(params.validate().is_err(), "size {}", size);
        }
    }

    #[test]
    fn rejects_input_format_with_shell_characters() {
        let mut params = base_params();
        params.input_format = "mjpeg;rm".to_string();
        assert!(params.validate().is_err());
    }

    #[test]
    fn rejects_control_characters_in_alias() {
        let mut params = base_params();
        params.alias = "cam\u{1b}[31m".to_string();
        assert!(params.validate().is_err());
    }

    #[test]
    fn rejects_extra_args_with_newlines() {
        let mut params = base_params();
        params.extra_args = vec!["-b:v".to_string(), "4000k\n-y".to_string()];
        assert!(params.validate().is_err());
    }

    #[test]
    fn frame_size_serializes_as_string() {
        let (_, spec) = base_params().validate().unwrap();
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["frame_size"], "1280x720");

        let decoded: LaunchSpec = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, spec);
    }
}
