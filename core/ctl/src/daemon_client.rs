//! Client helper for talking to the camstream daemon.
//!
//! One request per connection. Most methods get a single response line;
//! `logs` gets a stream of frames and `attach` turns the socket into a raw
//! byte pipe after its first response.

use camstream_protocol::{
    AttachResult, ErrorInfo, LogChunk, Method, Request, Response, MAX_REQUEST_BYTES,
};
use chrono::Utc;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::env;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

const SOCKET_ENV: &str = "CAMSTREAM_SOCKET";
const HOME_DIR_NAME: &str = ".camstream";
const SOCKET_NAME: &str = "daemon.sock";
const WRITE_TIMEOUT_MS: u64 = 2_000;
// Covers a start that waits out the launch timeout, or a stop that escalates.
const READ_TIMEOUT_MS: u64 = 30_000;
const CONNECT_RETRY_DELAY_MS: u64 = 50;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Home directory not found")]
    NoHome,

    #[error("Failed to connect to daemon at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Timed out waiting for daemon response")]
    Timeout,

    #[error("Daemon connection failed: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to parse daemon response: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Daemon closed the connection without a response")]
    Closed,

    #[error("Daemon response exceeded maximum size")]
    TooLarge,

    #[error("{}: {}", .0.code, .0.message)]
    Daemon(ErrorInfo),
}

pub fn socket_path() -> Result<PathBuf, ClientError> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir().ok_or(ClientError::NoHome)?;
    Ok(home.join(HOME_DIR_NAME).join(SOCKET_NAME))
}

pub struct DaemonClient {
    socket: PathBuf,
}

impl DaemonClient {
    pub fn new(socket: PathBuf) -> Self {
        Self { socket }
    }

    pub fn from_env() -> Result<Self, ClientError> {
        socket_path().map(Self::new)
    }

    /// Sends one request and decodes the `data` of its single response.
    pub fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let mut connection = self.open(method, params, Some(READ_TIMEOUT_MS))?;
        let response = connection.next_response()?;
        decode_data(response)
    }

    /// Runs a `logs` request, handing each frame to `on_chunk` until the
    /// daemon marks the stream finished.
    pub fn stream_logs<F>(
        &self,
        id: &str,
        tail: Option<usize>,
        follow: bool,
        mut on_chunk: F,
    ) -> Result<(), ClientError>
    where
        F: FnMut(LogChunk) -> io::Result<()>,
    {
        let params = serde_json::json!({ "id": id, "tail": tail, "follow": follow });
        let timeout = if follow { None } else { Some(READ_TIMEOUT_MS) };
        let mut connection = self.open(Method::Logs, Some(params), timeout)?;
        loop {
            let chunk: LogChunk = decode_data(connection.next_response()?)?;
            let eof = chunk.eof;
            on_chunk(chunk)?;
            if eof {
                return Ok(());
            }
        }
    }

    /// Attaches to a live session. Returns the handshake, the raw stream and
    /// any output bytes that arrived with it.
    pub fn attach(&self, id: &str) -> Result<(AttachResult, UnixStream, Vec<u8>), ClientError> {
        let params = serde_json::json!({ "id": id });
        let mut connection = self.open(Method::Attach, Some(params), Some(READ_TIMEOUT_MS))?;
        let attached: AttachResult = decode_data(connection.next_response()?)?;
        let leftover = connection.reader.buffer().to_vec();
        let stream = connection.reader.into_inner();
        stream.set_read_timeout(None)?;
        Ok((attached, stream, leftover))
    }

    fn open(
        &self,
        method: Method,
        params: Option<Value>,
        read_timeout_ms: Option<u64>,
    ) -> Result<Connection, ClientError> {
        let mut stream = self.connect()?;
        let _ = stream.set_read_timeout(read_timeout_ms.map(Duration::from_millis));
        let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

        let mut request = Request::new(method, params);
        request.id = Some(make_request_id());
        tracing::debug!(method = ?method, id = ?request.id, "Sending daemon request");

        let mut payload = serde_json::to_vec(&request).map_err(ClientError::Encode)?;
        payload.push(b'\n');
        stream.write_all(&payload)?;
        stream.flush()?;

        Ok(Connection {
            reader: BufReader::new(stream),
        })
    }

    /// Connects, retrying once after a short pause.
    fn connect(&self) -> Result<UnixStream, ClientError> {
        match UnixStream::connect(&self.socket) {
            Ok(stream) => Ok(stream),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to connect to daemon; retrying");
                std::thread::sleep(Duration::from_millis(CONNECT_RETRY_DELAY_MS));
                UnixStream::connect(&self.socket).map_err(|source| ClientError::Connect {
                    path: self.socket.clone(),
                    source,
                })
            }
        }
    }
}

struct Connection {
    reader: BufReader<UnixStream>,
}

impl Connection {
    fn next_response(&mut self) -> Result<Response, ClientError> {
        let mut line = Vec::new();
        let read = (&mut self.reader)
            .take(MAX_REQUEST_BYTES as u64 + 1)
            .read_until(b'\n', &mut line)
            .map_err(|err| match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ClientError::Timeout,
                _ => ClientError::Io(err),
            })?;
        if read == 0 {
            return Err(ClientError::Closed);
        }
        if line.last() != Some(&b'\n') && line.len() > MAX_REQUEST_BYTES {
            return Err(ClientError::TooLarge);
        }
        let trimmed = line.strip_suffix(b"\n").unwrap_or(&line);
        serde_json::from_slice(trimmed).map_err(ClientError::Decode)
    }
}

fn decode_data<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    if !response.ok {
        let error = response.error.unwrap_or_else(|| {
            ErrorInfo::new("unknown_error", "daemon reported failure without details")
        });
        return Err(ClientError::Daemon(error));
    }
    serde_json::from_value(response.data.unwrap_or(Value::Null)).map_err(ClientError::Decode)
}

fn make_request_id() -> String {
    let mut random = rand::thread_rng();
    format!(
        "req-{}-{}-{:x}",
        Utc::now().timestamp_millis(),
        std::process::id(),
        random.next_u64()
    )
}
