//! Control Server.
//!
//! Newline-delimited JSON over a Unix socket, one thread per connection.
//! Most methods are one request and one response. `logs` with `follow` keeps
//! writing `LogChunk` frames; `attach` answers once and then turns the
//! connection into a raw byte pipe to the encoder.

use camstream_protocol::{
    parse_logs_params, parse_params, parse_session_params, AttachResult, DevicesResult, ErrorInfo,
    ListResult, LogChunk, Method, PingResult, Request, Response, SessionCounts, SessionResult,
    ShutdownResult, StartParams, StartResult, StatusResult, ERROR_EMPTY_REQUEST, ERROR_INTERNAL,
    ERROR_INVALID_JSON, ERROR_PROTOCOL_MISMATCH, ERROR_READ, ERROR_READ_TIMEOUT,
    ERROR_REQUEST_TOO_LARGE, ERROR_TOO_MANY_CONNECTIONS, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde::Serialize;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::ControlError;
use crate::logs::LogFollower;
use crate::manager::SessionManager;

const READ_CHUNK_SIZE: usize = 4096;
const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(250);
const ATTACH_POLL_INTERVAL: Duration = Duration::from_millis(100);
const REJECT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct ServerContext {
    manager: Arc<SessionManager>,
    config: ServerConfig,
    stop_sessions_on_shutdown: bool,
    started: Instant,
    active: Arc<AtomicUsize>,
    shutdown: Sender<()>,
}

impl ServerContext {
    pub fn new(
        manager: Arc<SessionManager>,
        config: ServerConfig,
        stop_sessions_on_shutdown: bool,
        shutdown: Sender<()>,
    ) -> Self {
        Self {
            manager,
            config,
            stop_sessions_on_shutdown,
            started: Instant::now(),
            active: Arc::new(AtomicUsize::new(0)),
            shutdown,
        }
    }
}

/// Decrements the active connection count when the connection ends.
struct ConnectionPermit(Arc<AtomicUsize>);

impl ConnectionPermit {
    fn acquire(active: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        let previous = active.fetch_add(1, Ordering::SeqCst);
        if previous >= limit {
            active.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(Self(Arc::clone(active)))
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn serve(listener: UnixListener, context: Arc<ServerContext>) {
    for stream in listener.incoming() {
        match stream {
            Ok(mut stream) => {
                let Some(permit) =
                    ConnectionPermit::acquire(&context.active, context.config.max_connections)
                else {
                    warn!(
                        limit = context.config.max_connections,
                        "Rejecting connection over limit"
                    );
                    let _ = stream.set_write_timeout(Some(REJECT_WRITE_TIMEOUT));
                    let _ = write_response(
                        &mut stream,
                        &Response::error(
                            None,
                            ERROR_TOO_MANY_CONNECTIONS,
                            "too many active connections",
                        ),
                    );
                    continue;
                };
                let context = Arc::clone(&context);
                thread::spawn(move || {
                    let _permit = permit;
                    handle_connection(stream, context);
                });
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn handle_connection(mut stream: UnixStream, context: Arc<ServerContext>) {
    let timeout = Duration::from_millis(context.config.read_timeout_ms.max(1));
    let (request, trailing) = match read_request(&mut stream, timeout) {
        Ok(parts) => parts,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let _ = write_response(&mut stream, &Response::error_with_info(None, err));
            return;
        }
    };

    if request.protocol_version != PROTOCOL_VERSION {
        let _ = write_response(
            &mut stream,
            &Response::error(
                request.id,
                ERROR_PROTOCOL_MISMATCH,
                format!(
                    "unsupported protocol version {} (daemon speaks {})",
                    request.protocol_version, PROTOCOL_VERSION
                ),
            ),
        );
        return;
    }

    debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    match request.method {
        Method::Logs => handle_logs(stream, request, &context),
        Method::Attach => handle_attach(stream, request, trailing, &context),
        Method::Shutdown => handle_shutdown(stream, request, &context),
        _ => {
            let response = handle_request(request, &context);
            let _ = write_response(&mut stream, &response);
        }
    }
}

/// Reads one request line. Bytes that arrived after the newline are
/// returned alongside it.
fn read_request(
    stream: &mut UnixStream,
    timeout: Duration,
) -> Result<(Request, Vec<u8>), ErrorInfo> {
    let _ = stream.set_read_timeout(Some(timeout));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if chunk[..n].contains(&b'\n') {
                    break;
                }
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        ERROR_REQUEST_TOO_LARGE,
                        "request exceeded maximum size",
                    ));
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new(ERROR_READ_TIMEOUT, "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    ERROR_READ,
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }
    let _ = stream.set_read_timeout(None);

    let (request_bytes, trailing) = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => (&buffer[..index], buffer[index + 1..].to_vec()),
        None => (buffer.as_slice(), Vec::new()),
    };
    if request_bytes.len() > MAX_REQUEST_BYTES {
        return Err(ErrorInfo::new(
            ERROR_REQUEST_TOO_LARGE,
            "request exceeded maximum size",
        ));
    }
    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new(ERROR_EMPTY_REQUEST, "request body was empty"));
    }

    let request = serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            ERROR_INVALID_JSON,
            format!("request was not valid JSON: {}", err),
        )
    })?;
    Ok((request, trailing))
}

fn handle_request(request: Request, context: &ServerContext) -> Response {
    let manager = &context.manager;
    let id = request.id;

    match request.method {
        Method::Start => {
            let params: StartParams = match parse_params(request.params) {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(id, err),
            };
            respond(
                id,
                manager.start(&params).map(|session| StartResult {
                    id: session.id.clone(),
                    session,
                }),
            )
        }
        Method::Stop => match parse_session_params(request.params) {
            Ok(params) => respond(id, manager.stop(&params.id).map(|session| SessionResult { session })),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::Restart => match parse_session_params(request.params) {
            Ok(params) => respond(
                id,
                manager
                    .restart(&params.id)
                    .map(|session| SessionResult { session }),
            ),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::List => respond(id, manager.list().map(|sessions| ListResult { sessions })),
        Method::Status => match parse_session_params(request.params) {
            Ok(params) => respond(
                id,
                manager
                    .status(&params.id)
                    .map(|(session, transitions)| StatusResult {
                        session,
                        transitions,
                    }),
            ),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::Ping => respond(
            id,
            manager.summary().map(|summary| PingResult {
                ok: true,
                pid: std::process::id(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                protocol_version: PROTOCOL_VERSION,
                uptime_secs: context.started.elapsed().as_secs(),
                sessions: SessionCounts {
                    total: summary.total,
                    active: summary.active,
                },
            }),
        ),
        Method::Devices => respond(
            id,
            Ok(DevicesResult {
                devices: manager.devices(),
            }),
        ),
        Method::Logs | Method::Attach | Method::Shutdown => Response::error(
            id,
            ERROR_INTERNAL,
            "streaming method routed to request handler",
        ),
    }
}

fn respond<T: Serialize>(id: Option<String>, result: Result<T, ControlError>) -> Response {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(data) => Response::ok(id, data),
            Err(err) => Response::error(
                id,
                ERROR_INTERNAL,
                format!("Failed to serialize response: {}", err),
            ),
        },
        Err(err) => {
            let info = err.to_error_info();
            debug!(code = %info.code, message = %info.message, "Request failed");
            Response::error_with_info(id, info)
        }
    }
}

fn handle_logs(mut stream: UnixStream, request: Request, context: &ServerContext) {
    let id = request.id;
    let params = match parse_logs_params(request.params) {
        Ok(params) => params,
        Err(err) => {
            let _ = write_response(&mut stream, &Response::error_with_info(id, err));
            return;
        }
    };
    let manager = &context.manager;
    let (_, mut lines, mut follower) = match manager.open_log(&params.id, params.tail_lines()) {
        Ok(opened) => opened,
        Err(err) => {
            let _ = write_response(&mut stream, &respond::<()>(id, Err(err)));
            return;
        }
    };

    if !params.follow {
        lines.extend(follower.flush_partial());
        let _ = write_chunk(&mut stream, &id, lines, true);
        return;
    }
    if write_chunk(&mut stream, &id, lines, false).is_err() {
        return;
    }

    loop {
        thread::sleep(FOLLOW_POLL_INTERVAL);
        let finished = !manager.is_live(&params.id);
        let mut lines = match follower.read_lines() {
            Ok(lines) => lines,
            Err(err) => {
                warn!(session_id = %params.id, error = %err, "Failed to follow session log");
                let _ = write_chunk(&mut stream, &id, Vec::new(), true);
                return;
            }
        };

        if finished {
            lines.extend(follower.flush_partial());
            let _ = write_chunk(&mut stream, &id, lines, true);
            return;
        }
        if !lines.is_empty() {
            if write_chunk(&mut stream, &id, lines, false).is_err() {
                return;
            }
        } else if client_closed(&stream) {
            debug!(session_id = %params.id, "Log follower disconnected");
            return;
        }
    }
}

fn write_chunk(
    stream: &mut UnixStream,
    id: &Option<String>,
    lines: Vec<String>,
    eof: bool,
) -> io::Result<()> {
    write_response(
        stream,
        &respond(id.clone(), Ok(LogChunk { lines, eof })),
    )
}

/// True once the peer has closed its side of the connection.
fn client_closed(stream: &UnixStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return true;
    }
    let mut probe = [0u8; 64];
    let closed = match (&*stream).read(&mut probe) {
        Ok(0) => true,
        Ok(_) => false,
        Err(err) => err.kind() != io::ErrorKind::WouldBlock,
    };
    let _ = stream.set_nonblocking(false);
    closed
}

fn handle_attach(
    mut stream: UnixStream,
    request: Request,
    trailing: Vec<u8>,
    context: &ServerContext,
) {
    let id = request.id;
    let params = match parse_session_params(request.params) {
        Ok(params) => params,
        Err(err) => {
            let _ = write_response(&mut stream, &Response::error_with_info(id, err));
            return;
        }
    };
    let manager = Arc::clone(&context.manager);
    let session_id = params.id;

    let (record, handle) = match manager.live_process(&session_id) {
        Ok(live) => live,
        Err(err) => {
            let _ = write_response(&mut stream, &respond::<()>(id, Err(err)));
            return;
        }
    };
    let mut follower = match LogFollower::from_end(Path::new(&record.log_path)) {
        Ok(follower) => follower,
        Err(err) => {
            let err = ControlError::LogRead {
                path: record.log_path.clone().into(),
                source: err,
            };
            let _ = write_response(&mut stream, &respond::<()>(id, Err(err)));
            return;
        }
    };

    let attached = AttachResult {
        attached: true,
        id: session_id.clone(),
        pid: handle.pid,
        log_path: record.log_path.clone(),
    };
    if write_response(&mut stream, &respond(id, Ok(attached))).is_err() {
        return;
    }
    info!(session_id = %session_id, pid = handle.pid, "Client attached");

    if !trailing.is_empty() {
        if let Err(err) = manager.send_input(&session_id, &trailing) {
            debug!(session_id = %session_id, error = %err, "Attach input rejected");
        }
    }

    let mut output = match stream.try_clone() {
        Ok(output) => output,
        Err(err) => {
            warn!(error = %err, "Failed to clone attach stream");
            return;
        }
    };
    let client_gone = Arc::new(AtomicBool::new(false));
    let process_gone = Arc::new(AtomicBool::new(false));

    let pump = {
        let manager = Arc::clone(&manager);
        let session_id = session_id.clone();
        let client_gone = Arc::clone(&client_gone);
        let process_gone = Arc::clone(&process_gone);
        thread::spawn(move || loop {
            thread::sleep(ATTACH_POLL_INTERVAL);
            let live = manager.is_live(&session_id);
            let bytes = follower.read_bytes().unwrap_or_default();
            if !bytes.is_empty() && output.write_all(&bytes).and_then(|_| output.flush()).is_err() {
                client_gone.store(true, Ordering::SeqCst);
                return;
            }
            if client_gone.load(Ordering::SeqCst) {
                return;
            }
            if !live {
                process_gone.store(true, Ordering::SeqCst);
                let _ = output.shutdown(Shutdown::Write);
                return;
            }
        })
    };

    let _ = stream.set_read_timeout(Some(ATTACH_POLL_INTERVAL));
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if let Err(err) = manager.send_input(&session_id, &buf[..n]) {
                    debug!(session_id = %session_id, error = %err, "Attach input rejected");
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                if process_gone.load(Ordering::SeqCst) || client_gone.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    client_gone.store(true, Ordering::SeqCst);
    let _ = pump.join();
    info!(session_id = %session_id, "Client detached");
}

fn handle_shutdown(mut stream: UnixStream, request: Request, context: &ServerContext) {
    info!("Shutdown requested");
    let _ = write_response(
        &mut stream,
        &respond(
            request.id,
            Ok(ShutdownResult {
                shutting_down: true,
                stop_sessions: context.stop_sessions_on_shutdown,
            }),
        ),
    );
    let _ = context.shutdown.send(());
}

fn write_response(stream: &mut UnixStream, response: &Response) -> io::Result<()> {
    serde_json::to_writer(&mut *stream, response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
