//! Daemon configuration loaded from `~/.camstream/config.toml`.
//!
//! A missing file means defaults. Every section and key is optional so an
//! operator only writes what they want to change.

use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_ENV: &str = "CAMSTREAM_CONFIG";
const SOCKET_ENV: &str = "CAMSTREAM_SOCKET";
const HOME_DIR_NAME: &str = ".camstream";
const SOCKET_NAME: &str = "daemon.sock";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Home directory not found")]
    NoHome,

    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    pub state_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub socket: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncoderConfig {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_input_driver")]
    pub input_driver: String,
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default = "default_true")]
    pub interactive_stdin: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            input_driver: default_input_driver(),
            output_format: default_output_format(),
            interactive_stdin: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_kill_wait_ms")]
    pub kill_wait_ms: u64,
    #[serde(default = "default_launch_confirm_ms")]
    pub launch_confirm_ms: u64,
    #[serde(default = "default_launch_timeout_ms")]
    pub launch_timeout_ms: u64,
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_grace_ms: default_stop_grace_ms(),
            kill_wait_ms: default_kill_wait_ms(),
            launch_confirm_ms: default_launch_confirm_ms(),
            launch_timeout_ms: default_launch_timeout_ms(),
            reap_interval_ms: default_reap_interval_ms(),
        }
    }
}

impl SupervisorConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }

    pub fn launch_confirm(&self) -> Duration {
        Duration::from_millis(self.launch_confirm_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms.max(1))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms.max(10))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShutdownConfig {
    #[serde(default = "default_true")]
    pub stop_sessions: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            stop_sessions: true,
        }
    }
}

/// Resolved filesystem layout for one daemon instance.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub home: PathBuf,
    pub state_dir: PathBuf,
    pub session_log_dir: PathBuf,
    pub daemon_log_dir: PathBuf,
    pub socket: PathBuf,
}

impl DaemonPaths {
    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("sessions.db")
    }
}

impl DaemonConfig {
    pub fn resolve_paths(&self, home: &Path) -> DaemonPaths {
        let base = home.join(HOME_DIR_NAME);
        let socket = env::var(SOCKET_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .or_else(|| self.paths.socket.clone())
            .unwrap_or_else(|| base.join(SOCKET_NAME));

        DaemonPaths {
            state_dir: self
                .paths
                .state_dir
                .clone()
                .unwrap_or_else(|| base.join("state")),
            session_log_dir: self
                .paths
                .log_dir
                .clone()
                .unwrap_or_else(|| base.join("logs").join("sessions")),
            daemon_log_dir: base.join("logs"),
            socket,
            home: base,
        }
    }
}

pub fn home_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::NoHome)
}

pub fn default_config_path(home: &Path) -> PathBuf {
    match env::var(CONFIG_ENV) {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => home.join(HOME_DIR_NAME).join("config.toml"),
    }
}

pub fn load_config(path: &Path) -> Result<DaemonConfig, ConfigError> {
    if !path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<DaemonConfig>(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn default_program() -> String {
    "ffmpeg".to_string()
}

fn default_input_driver() -> String {
    "v4l2".to_string()
}

fn default_output_format() -> String {
    "libndi_newtek".to_string()
}

fn default_true() -> bool {
    true
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

fn default_kill_wait_ms() -> u64 {
    5_000
}

fn default_launch_confirm_ms() -> u64 {
    500
}

fn default_launch_timeout_ms() -> u64 {
    10_000
}

fn default_reap_interval_ms() -> u64 {
    100
}

fn default_max_connections() -> usize {
    64
}

fn default_read_timeout_ms() -> u64 {
    2_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_defaults_when_file_missing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config = load_config(&temp_dir.path().join("missing.toml")).expect("load config");
        assert_eq!(config.encoder.program, "ffmpeg");
        assert_eq!(config.supervisor.stop_grace_ms, 5_000);
        assert_eq!(config.server.max_connections, 64);
        assert!(config.shutdown.stop_sessions);
    }

    #[test]
    fn load_config_parses_partial_sections() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(
            &path,
            r#"
[encoder]
program = "/opt/ffmpeg/bin/ffmpeg"
interactive_stdin = false

[supervisor]
stop_grace_ms = 1500

[paths]
log_dir = "/var/log/camstream"
"#,
        )
        .expect("write config");

        let config = load_config(&path).expect("load config");
        assert_eq!(config.encoder.program, "/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(config.encoder.output_format, "libndi_newtek");
        assert!(!config.encoder.interactive_stdin);
        assert_eq!(config.supervisor.stop_grace(), Duration::from_millis(1500));
        assert_eq!(config.supervisor.kill_wait_ms, 5_000);

        let paths = config.resolve_paths(Path::new("/home/op"));
        assert_eq!(paths.session_log_dir, PathBuf::from("/var/log/camstream"));
        assert_eq!(paths.state_dir, PathBuf::from("/home/op/.camstream/state"));
    }

    #[test]
    fn load_config_rejects_unknown_keys() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "[encoder]\nprogramm = \"ffmpeg\"\n").expect("write config");
        assert!(matches!(
            load_config(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
