//! Process Supervisor.
//!
//! Spawns encoder processes with their output appended to the session log and
//! watches them from a per-child monitor thread. Every handle produces at most
//! one `ExitReport`: whoever claims the exit first (the monitor thread, which
//! sends it on the exit channel, or an inline `poll_exit`, which returns it)
//! owns it.

use chrono::Utc;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::locks::lock_unpoisoned;
use crate::process::{get_process_start_time, is_same_process, send_signal};

/// Everything needed to launch one encoder process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub session_id: String,
    pub argv: Vec<String>,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Unique per launch; a relaunched session gets a new handle id.
    pub id: u64,
    pub session_id: String,
    pub pid: u32,
    pub proc_started: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub handle_id: u64,
    pub session_id: String,
    pub pid: u32,
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitReport {
    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exited with code {}", code),
            (None, Some(signal)) => format!("terminated by signal {}", signal),
            (None, None) => "exited".to_string(),
        }
    }
}

pub trait Supervisor: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<ProcessHandle, SupervisorError>;

    /// Re-attaches to a process left behind by an earlier daemon instance.
    /// Returns `None` when the pid is gone or now belongs to another process.
    fn adopt(&self, session_id: &str, pid: u32, proc_started: Option<u64>)
        -> Option<ProcessHandle>;

    /// Non-blocking exit check. Returns the report only to the caller that
    /// claims it; later calls (and the monitor thread) see `None`.
    fn poll_exit(&self, handle: &ProcessHandle) -> Option<ExitReport>;

    fn signal_stop(&self, handle: &ProcessHandle) -> Result<(), SupervisorError>;

    fn force_kill(&self, handle: &ProcessHandle) -> Result<(), SupervisorError>;

    fn write_input(&self, handle: &ProcessHandle, bytes: &[u8]) -> Result<(), SupervisorError>;
}

enum ChildState {
    Owned(Child),
    Adopted,
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

struct ChildSlot {
    handle: ProcessHandle,
    state: Mutex<ChildState>,
    reported: AtomicBool,
    stdin: Mutex<Option<ChildStdin>>,
}

impl ChildSlot {
    fn new(handle: ProcessHandle, state: ChildState, stdin: Option<ChildStdin>) -> Self {
        Self {
            handle,
            state: Mutex::new(state),
            reported: AtomicBool::new(false),
            stdin: Mutex::new(stdin),
        }
    }

    /// Returns the exit report if the process has exited, without claiming it.
    fn observe_exit(&self) -> Option<ExitReport> {
        let mut state = lock_unpoisoned(&self.state);
        let exited = match &mut *state {
            ChildState::Exited { code, signal } => Some((*code, *signal)),
            ChildState::Owned(child) => match child.try_wait() {
                Ok(Some(status)) => Some(split_status(status)),
                Ok(None) => None,
                Err(err) => {
                    warn!(
                        session_id = %self.handle.session_id,
                        pid = self.handle.pid,
                        error = %err,
                        "Failed to poll encoder process"
                    );
                    None
                }
            },
            ChildState::Adopted => {
                if is_same_process(self.handle.pid, self.handle.proc_started) {
                    None
                } else {
                    Some((None, None))
                }
            }
        };

        let (code, signal) = exited?;
        *state = ChildState::Exited { code, signal };
        drop(state);
        lock_unpoisoned(&self.stdin).take();

        Some(ExitReport {
            handle_id: self.handle.id,
            session_id: self.handle.session_id.clone(),
            pid: self.handle.pid,
            code,
            signal,
        })
    }

    fn claim(&self) -> bool {
        !self.reported.swap(true, Ordering::SeqCst)
    }

    fn signal(&self, signal: i32) -> Result<(), SupervisorError> {
        let mut state = lock_unpoisoned(&self.state);
        let deliver = match &mut *state {
            ChildState::Exited { .. } => false,
            // An unreaped child keeps its pid, so it cannot have been recycled.
            ChildState::Owned(child) => !matches!(child.try_wait(), Ok(Some(_))),
            ChildState::Adopted => is_same_process(self.handle.pid, self.handle.proc_started),
        };
        if !deliver {
            return Ok(());
        }

        send_signal(self.handle.pid, signal).map_err(|source| SupervisorError::Signal {
            pid: self.handle.pid,
            source,
        })
    }
}

type SlotMap = Arc<Mutex<HashMap<u64, Arc<ChildSlot>>>>;

pub struct ProcessSupervisor {
    slots: SlotMap,
    next_id: AtomicU64,
    exits: Sender<ExitReport>,
    reap_interval: Duration,
    interactive_stdin: bool,
}

impl ProcessSupervisor {
    pub fn new(exits: Sender<ExitReport>, reap_interval: Duration, interactive_stdin: bool) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            exits,
            reap_interval,
            interactive_stdin,
        }
    }

    fn slot(&self, handle: &ProcessHandle) -> Result<Arc<ChildSlot>, SupervisorError> {
        lock_unpoisoned(&self.slots)
            .get(&handle.id)
            .cloned()
            .ok_or(SupervisorError::UnknownHandle(handle.id))
    }

    fn watch(&self, slot: Arc<ChildSlot>) {
        lock_unpoisoned(&self.slots).insert(slot.handle.id, Arc::clone(&slot));

        let slots = Arc::clone(&self.slots);
        let exits = self.exits.clone();
        let interval = self.reap_interval;
        thread::spawn(move || monitor(slots, slot, exits, interval));
    }
}

fn monitor(slots: SlotMap, slot: Arc<ChildSlot>, exits: Sender<ExitReport>, interval: Duration) {
    loop {
        thread::sleep(interval);
        if let Some(report) = slot.observe_exit() {
            if slot.claim() {
                debug!(
                    session_id = %report.session_id,
                    pid = report.pid,
                    "Encoder exit observed by monitor"
                );
                if exits.send(report).is_err() {
                    warn!(
                        session_id = %slot.handle.session_id,
                        "Exit listener is gone; dropping exit report"
                    );
                }
            }
            break;
        }
    }
    lock_unpoisoned(&slots).remove(&slot.handle.id);
}

impl Supervisor for ProcessSupervisor {
    fn spawn(&self, request: &SpawnRequest) -> Result<ProcessHandle, SupervisorError> {
        let (program, args) = request
            .argv
            .split_first()
            .ok_or(SupervisorError::EmptyArgv)?;

        let mut log = open_log(&request.log_path)?;
        writeln!(
            log,
            "=== {} launching session {}: {} ===",
            Utc::now().to_rfc3339(),
            request.session_id,
            request.argv.join(" ")
        )
        .map_err(|source| SupervisorError::Log {
            path: request.log_path.clone(),
            source,
        })?;
        let stderr = log.try_clone().map_err(|source| SupervisorError::Log {
            path: request.log_path.clone(),
            source,
        })?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .stdin(if self.interactive_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Keep terminal signals aimed at the daemon away from encoders.
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            program: program.clone(),
            source,
        })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let handle = ProcessHandle {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            session_id: request.session_id.clone(),
            pid,
            proc_started: get_process_start_time(pid),
        };
        info!(session_id = %handle.session_id, pid, "Encoder spawned");

        self.watch(Arc::new(ChildSlot::new(
            handle.clone(),
            ChildState::Owned(child),
            stdin,
        )));
        Ok(handle)
    }

    fn adopt(
        &self,
        session_id: &str,
        pid: u32,
        proc_started: Option<u64>,
    ) -> Option<ProcessHandle> {
        if !is_same_process(pid, proc_started) {
            return None;
        }
        let handle = ProcessHandle {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            session_id: session_id.to_string(),
            pid,
            proc_started,
        };
        info!(session_id, pid, "Adopted running encoder");
        self.watch(Arc::new(ChildSlot::new(
            handle.clone(),
            ChildState::Adopted,
            None,
        )));
        Some(handle)
    }

    fn poll_exit(&self, handle: &ProcessHandle) -> Option<ExitReport> {
        let slot = self.slot(handle).ok()?;
        let report = slot.observe_exit()?;
        slot.claim().then_some(report)
    }

    fn signal_stop(&self, handle: &ProcessHandle) -> Result<(), SupervisorError> {
        match self.slot(handle) {
            Ok(slot) => slot.signal(libc::SIGTERM),
            // Already reaped and reported.
            Err(SupervisorError::UnknownHandle(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn force_kill(&self, handle: &ProcessHandle) -> Result<(), SupervisorError> {
        match self.slot(handle) {
            Ok(slot) => slot.signal(libc::SIGKILL),
            Err(SupervisorError::UnknownHandle(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn write_input(&self, handle: &ProcessHandle, bytes: &[u8]) -> Result<(), SupervisorError> {
        let slot = self.slot(handle)?;
        let mut stdin = lock_unpoisoned(&slot.stdin);
        let pipe = stdin.as_mut().ok_or(SupervisorError::NoInput)?;
        pipe.write_all(bytes)
            .and_then(|_| pipe.flush())
            .map_err(SupervisorError::Input)
    }
}

fn open_log(path: &Path) -> Result<File, SupervisorError> {
    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent).map_err(|source| SupervisorError::Log {
            path: path.to_path_buf(),
            source,
        })?;
    }
    fs_err::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(|file| file.into_parts().0)
        .map_err(|source| SupervisorError::Log {
            path: path.to_path_buf(),
            source,
        })
}

fn split_status(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        (status.code(), status.signal())
    }
    #[cfg(not(unix))]
    {
        (status.code(), None)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    fn shell(script: &str, log_path: PathBuf) -> SpawnRequest {
        SpawnRequest {
            session_id: "ses-test".to_string(),
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            log_path,
        }
    }

    fn wait_report(rx: &mpsc::Receiver<ExitReport>) -> ExitReport {
        rx.recv_timeout(Duration::from_secs(10))
            .expect("exit report within 10s")
    }

    #[test]
    fn reports_exit_code_once_and_captures_output() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let log_path = temp_dir.path().join("logs").join("ses-test.log");
        let (tx, rx) = mpsc::channel();
        let supervisor = ProcessSupervisor::new(tx, Duration::from_millis(20), false);

        let handle = supervisor
            .spawn(&shell("echo out; echo err >&2; exit 3", log_path.clone()))
            .expect("spawn");
        let report = wait_report(&rx);
        assert_eq!(report.handle_id, handle.id);
        assert_eq!(report.code, Some(3));
        assert_eq!(report.describe(), "exited with code 3");

        assert!(supervisor.poll_exit(&handle).is_none());
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        let log = fs_err::read_to_string(&log_path).expect("read log");
        assert!(log.contains("launching session ses-test"));
        assert!(log.contains("out\n"));
        assert!(log.contains("err\n"));
    }

    #[test]
    fn inline_poll_claims_exit_before_monitor() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let (tx, rx) = mpsc::channel();
        let supervisor = ProcessSupervisor::new(tx, Duration::from_secs(2), false);

        let handle = supervisor
            .spawn(&shell("exit 0", temp_dir.path().join("a.log")))
            .expect("spawn");
        let deadline = Instant::now() + Duration::from_secs(5);
        let report = loop {
            if let Some(report) = supervisor.poll_exit(&handle) {
                break report;
            }
            assert!(Instant::now() < deadline, "process never exited");
            thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(report.code, Some(0));
        assert!(rx.recv_timeout(Duration::from_secs(3)).is_err());
    }

    #[test]
    fn signal_stop_terminates_and_reports_signal() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let (tx, rx) = mpsc::channel();
        let supervisor = ProcessSupervisor::new(tx, Duration::from_millis(20), false);

        let handle = supervisor
            .spawn(&shell("exec sleep 30", temp_dir.path().join("b.log")))
            .expect("spawn");
        supervisor.signal_stop(&handle).expect("sigterm");
        let report = wait_report(&rx);
        assert_eq!(report.code, None);
        assert_eq!(report.signal, Some(libc::SIGTERM));

        // Signalling a reaped handle is a no-op.
        supervisor.force_kill(&handle).expect("kill after exit");
    }

    #[test]
    fn force_kill_ends_process_ignoring_sigterm() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let (tx, rx) = mpsc::channel();
        let supervisor = ProcessSupervisor::new(tx, Duration::from_millis(20), false);

        let handle = supervisor
            .spawn(&shell(
                "trap '' TERM; while true; do sleep 1; done",
                temp_dir.path().join("c.log"),
            ))
            .expect("spawn");
        thread::sleep(Duration::from_millis(200));
        supervisor.signal_stop(&handle).expect("sigterm");
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());

        supervisor.force_kill(&handle).expect("sigkill");
        let report = wait_report(&rx);
        assert_eq!(report.signal, Some(libc::SIGKILL));
    }

    #[test]
    fn spawn_failure_names_program() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let (tx, _rx) = mpsc::channel();
        let supervisor = ProcessSupervisor::new(tx, Duration::from_millis(20), false);

        let err = supervisor
            .spawn(&SpawnRequest {
                session_id: "ses-x".to_string(),
                argv: vec!["/nonexistent/encoder".to_string()],
                log_path: temp_dir.path().join("x.log"),
            })
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { ref program, .. } if program == "/nonexistent/encoder"));

        let err = supervisor
            .spawn(&SpawnRequest {
                session_id: "ses-x".to_string(),
                argv: vec![],
                log_path: temp_dir.path().join("x.log"),
            })
            .unwrap_err();
        assert!(matches!(err, SupervisorError::EmptyArgv));
    }

    #[test]
    fn unopenable_log_error_names_the_path() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let log_path = temp_dir.path().join("taken");
        fs_err::create_dir_all(&log_path).expect("dir in place of log");
        let (tx, _rx) = mpsc::channel();
        let supervisor = ProcessSupervisor::new(tx, Duration::from_millis(20), false);

        let err = supervisor
            .spawn(&shell("exit 0", log_path.clone()))
            .unwrap_err();
        let SupervisorError::Log { source, .. } = err else {
            panic!("expected log error");
        };
        assert!(source.to_string().contains(&*log_path.to_string_lossy()));
    }

    #[test]
    fn write_input_reaches_stdin() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let log_path = temp_dir.path().join("d.log");
        let (tx, rx) = mpsc::channel();
        let supervisor = ProcessSupervisor::new(tx, Duration::from_millis(20), true);

        let handle = supervisor
            .spawn(&shell("read line; echo \"got $line\"", log_path.clone()))
            .expect("spawn");
        supervisor
            .write_input(&handle, b"hello\n")
            .expect("write input");
        let report = wait_report(&rx);
        assert_eq!(report.code, Some(0));
        let log = fs_err::read_to_string(&log_path).expect("read log");
        assert!(log.contains("got hello"));
    }

    #[test]
    fn adopt_refuses_dead_or_recycled_pids() {
        let (tx, _rx) = mpsc::channel();
        let supervisor = ProcessSupervisor::new(tx, Duration::from_millis(20), false);
        assert!(supervisor.adopt("ses-1", 999_999, None).is_none());

        let own_pid = std::process::id();
        let started = get_process_start_time(own_pid).expect("own start time");
        assert!(supervisor
            .adopt("ses-1", own_pid, Some(started + 3600))
            .is_none());
        let handle = supervisor
            .adopt("ses-1", own_pid, Some(started))
            .expect("adopt self");
        assert!(supervisor.poll_exit(&handle).is_none());
    }
}
