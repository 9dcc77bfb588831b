#![allow(dead_code)]

use camstream_protocol::{Method, Request, Response};
use serde_json::{json, Value};
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

/// Stand-in encoder. A stream name containing "crash" dies after a second,
/// "broken" dies immediately, anything else idles until signalled.
const FAKE_ENCODER: &str = r#"#!/bin/sh
for arg in "$@"; do
  case "$arg" in
    *broken*) echo "could not open input device"; exit 1 ;;
    *crash*) echo "encoder warming up"; sleep 1; echo "device disconnected"; exit 3 ;;
  esac
done
echo "encoder ready"
exec sleep 30
"#;

pub struct DaemonGuard {
    child: Child,
}

impl DaemonGuard {
    pub fn wait_exit(&mut self, timeout: Duration) -> Option<std::process::ExitStatus> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Some(status);
            }
            sleep(Duration::from_millis(25));
        }
        None
    }
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn camstream_dir(home: &Path) -> PathBuf {
    home.join(".camstream")
}

pub fn socket_path(home: &Path) -> PathBuf {
    camstream_dir(home).join("daemon.sock")
}

/// Writes the fake encoder and a config pointing at it.
pub fn write_fixture(home: &Path, extra_config: &str) {
    let dir = camstream_dir(home);
    fs::create_dir_all(&dir).expect("create camstream dir");

    let encoder = home.join("fake-encoder.sh");
    fs::write(&encoder, FAKE_ENCODER).expect("write fake encoder");
    fs::set_permissions(&encoder, fs::Permissions::from_mode(0o755)).expect("chmod encoder");

    let config = format!(
        "[encoder]\nprogram = {:?}\ninteractive_stdin = true\n\n\
         [supervisor]\nstop_grace_ms = 1000\nkill_wait_ms = 1000\nlaunch_confirm_ms = 300\n\n{}",
        encoder.display().to_string(),
        extra_config
    );
    fs::write(dir.join("config.toml"), config).expect("write config");
}

pub fn spawn_daemon(home: &Path) -> DaemonGuard {
    let child = Command::new(env!("CARGO_BIN_EXE_camstream-daemon"))
        .env("HOME", home)
        .env_remove("CAMSTREAM_CONFIG")
        .env_remove("CAMSTREAM_SOCKET")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn camstream-daemon");
    DaemonGuard { child }
}

pub fn can_bind_socket(home: &Path) -> bool {
    let probe_path = home.join("probe.sock");
    match UnixListener::bind(&probe_path) {
        Ok(listener) => {
            drop(listener);
            let _ = fs::remove_file(&probe_path);
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(_) => true,
    }
}

pub fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() && UnixStream::connect(path).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("timed out waiting for daemon socket at {}", path.display());
}

pub fn request(method: Method, params: Option<Value>) -> Request {
    let mut request = Request::new(method, params);
    request.id = Some(format!("test-{:?}", method).to_lowercase());
    request
}

pub fn send_request(socket: &Path, request: Request) -> Response {
    let mut stream = UnixStream::connect(socket).expect("failed to connect to daemon socket");
    serde_json::to_writer(&mut stream, &request).expect("failed to serialize request");
    stream.write_all(b"\n").expect("failed to write request");
    stream.flush().expect("failed to flush request");
    read_response(&mut stream)
}

pub fn send_raw_request(socket: &Path, payload: &[u8]) -> Response {
    let mut stream = UnixStream::connect(socket).expect("failed to connect to daemon socket");
    stream.write_all(payload).expect("failed to write raw payload");
    stream.flush().expect("failed to flush raw payload");
    read_response(&mut stream)
}

pub fn read_response(stream: &mut UnixStream) -> Response {
    let line = read_line(stream).expect("daemon closed connection without a response");
    serde_json::from_slice(&line).expect("failed to parse response JSON")
}

/// Reads one newline-terminated frame byte by byte so later frames stay
/// in the socket.
pub fn read_line(stream: &mut UnixStream) -> Option<Vec<u8>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                if byte[0] == b'\n' {
                    return Some(line);
                }
                line.push(byte[0]);
            }
            Err(err) => panic!("failed to read response: {}", err),
        }
    }
    if line.is_empty() {
        None
    } else {
        Some(line)
    }
}

pub fn start_params(alias: &str, device: &str) -> Value {
    json!({
        "alias": alias,
        "device": device,
        "frame_rate": 30,
        "frame_size": "1280x720",
        "input_format": "mjpeg",
    })
}

pub fn error_code(response: &Response) -> Option<&str> {
    response.error.as_ref().map(|err| err.code.as_str())
}

pub fn session_field<'a>(response: &'a Response, field: &str) -> Option<&'a Value> {
    response.data.as_ref()?.get("session")?.get(field)
}

pub fn session_status(socket: &Path, id: &str) -> Option<String> {
    let response = send_request(socket, request(Method::Status, Some(json!({ "id": id }))));
    session_field(&response, "status")?
        .as_str()
        .map(str::to_string)
}

pub fn wait_for_status(socket: &Path, id: &str, expected: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if session_status(socket, id).as_deref() == Some(expected) {
            return true;
        }
        sleep(Duration::from_millis(50));
    }
    false
}
