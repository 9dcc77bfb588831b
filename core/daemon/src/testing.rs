//! Test doubles shared by the daemon's unit tests.

use camstream_protocol::{
    FrameSize, LaunchSpec, SessionRecord, SessionStatus, StartParams, TransitionRecord,
};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::config::{EncoderConfig, SupervisorConfig};
use crate::db::Db;
use crate::error::{StoreError, SupervisorError};
use crate::manager::ManagerConfig;
use crate::session_store::{SessionStore, StatusUpdate};
use crate::supervisor::{ExitReport, ProcessHandle, SpawnRequest, Supervisor};

pub fn sample_record(id: &str, device: &str, status: SessionStatus) -> SessionRecord {
    let now = Utc::now().to_rfc3339();
    SessionRecord {
        id: id.to_string(),
        alias: "cam1".to_string(),
        device: device.to_string(),
        launch_spec: LaunchSpec {
            device: device.to_string(),
            frame_rate: 30,
            frame_size: FrameSize {
                width: 1280,
                height: 720,
            },
            input_format: "mjpeg".to_string(),
            stream_name: "cam1".to_string(),
            extra_args: vec!["-b:v".to_string(), "4000k".to_string()],
        },
        argv: vec!["ffmpeg".to_string(), "-i".to_string(), device.to_string()],
        status,
        pid: None,
        proc_started: None,
        log_path: format!("/tmp/{}.log", id),
        exit_code: None,
        last_error: None,
        restart_count: 0,
        created_at: now.clone(),
        started_at: None,
        stopped_at: None,
        updated_at: now,
    }
}

pub fn start_params(alias: &str, device: &str) -> StartParams {
    StartParams {
        alias: alias.to_string(),
        device: device.to_string(),
        frame_rate: 30,
        frame_size: "1280x720".to_string(),
        input_format: "mjpeg".to_string(),
        stream_name: None,
        extra_args: Vec::new(),
    }
}

pub fn test_config(root: &Path) -> ManagerConfig {
    ManagerConfig {
        encoder: EncoderConfig::default(),
        supervisor: SupervisorConfig {
            stop_grace_ms: 200,
            kill_wait_ms: 200,
            launch_confirm_ms: 50,
            launch_timeout_ms: 300,
            reap_interval_ms: 10,
        },
        session_log_dir: root.join("logs").join("sessions"),
    }
}

/// `Db` with switchable write failures.
pub struct FlakyStore {
    db: Db,
    fail_puts: AtomicBool,
    fail_updates: AtomicBool,
}

impl FlakyStore {
    pub fn open(root: &Path) -> Self {
        Self {
            db: Db::new(root.join("sessions.db")).expect("open test db"),
            fail_puts: AtomicBool::new(false),
            fail_updates: AtomicBool::new(false),
        }
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }
}

fn injected(path: &str) -> StoreError {
    StoreError::Dir {
        path: path.into(),
        source: io::Error::new(io::ErrorKind::Other, "injected failure"),
    }
}

impl SessionStore for FlakyStore {
    fn put(&self, record: &SessionRecord) -> Result<(), StoreError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(injected("put"));
        }
        self.db.put(record)
    }

    fn get(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        self.db.get(id)
    }

    fn list(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.db.list()
    }

    fn update_status(&self, id: &str, update: &StatusUpdate) -> Result<SessionRecord, StoreError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(injected("update_status"));
        }
        self.db.update_status(id, update)
    }

    fn transitions(&self, id: &str) -> Result<Vec<TransitionRecord>, StoreError> {
        self.db.transitions(id)
    }
}

struct FakeProcess {
    handle: ProcessHandle,
    exit: Option<(Option<i32>, Option<i32>)>,
    reported: bool,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    next_pid: u32,
    processes: HashMap<u64, FakeProcess>,
    spawned: Vec<SpawnRequest>,
    adoptable: HashSet<u32>,
    input: Vec<u8>,
    kills: usize,
    fail_spawns: bool,
    exit_on_spawn: Option<i32>,
    spawn_delay: Option<Duration>,
    ignore_terminate: bool,
    unkillable: bool,
}

/// In-memory supervisor. Processes "exit" when signalled (unless told to
/// ignore it) or when a test calls `finish`; exits are only seen by polling.
pub struct FakeSupervisor {
    state: Mutex<FakeState>,
}

impl FakeSupervisor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_id: 1,
                next_pid: 40_000,
                ..FakeState::default()
            }),
        }
    }

    fn with_state<T>(&self, op: impl FnOnce(&mut FakeState) -> T) -> T {
        op(&mut self.state.lock().expect("fake supervisor state"))
    }

    pub fn fail_spawns(&self, fail: bool) {
        self.with_state(|state| state.fail_spawns = fail);
    }

    pub fn exit_on_spawn(&self, code: Option<i32>) {
        self.with_state(|state| state.exit_on_spawn = code);
    }

    pub fn delay_spawns(&self, delay: Duration) {
        self.with_state(|state| state.spawn_delay = Some(delay));
    }

    pub fn set_ignore_terminate(&self, ignore: bool) {
        self.with_state(|state| state.ignore_terminate = ignore);
    }

    pub fn set_unkillable(&self, unkillable: bool) {
        self.with_state(|state| state.unkillable = unkillable);
    }

    pub fn allow_adopt(&self, pid: u32) {
        self.with_state(|state| state.adoptable.insert(pid));
    }

    pub fn spawned(&self) -> Vec<SpawnRequest> {
        self.with_state(|state| state.spawned.clone())
    }

    pub fn kills(&self) -> usize {
        self.with_state(|state| state.kills)
    }

    pub fn input(&self) -> Vec<u8> {
        self.with_state(|state| state.input.clone())
    }

    pub fn live_count(&self) -> usize {
        self.with_state(|state| {
            state
                .processes
                .values()
                .filter(|process| process.exit.is_none())
                .count()
        })
    }

    /// Most recent live handle for a session.
    pub fn handle_for(&self, session_id: &str) -> Option<ProcessHandle> {
        self.with_state(|state| {
            state
                .processes
                .values()
                .filter(|process| {
                    process.handle.session_id == session_id && process.exit.is_none()
                })
                .max_by_key(|process| process.handle.id)
                .map(|process| process.handle.clone())
        })
    }

    pub fn finish(&self, handle: &ProcessHandle, code: Option<i32>, signal: Option<i32>) {
        self.with_state(|state| {
            if let Some(process) = state.processes.get_mut(&handle.id) {
                process.exit.get_or_insert((code, signal));
            }
        });
    }

    /// Claims the exit report the way the monitor thread would.
    pub fn claim(&self, handle: &ProcessHandle) -> Option<ExitReport> {
        self.poll_exit(handle)
    }
}

impl Supervisor for FakeSupervisor {
    fn spawn(&self, request: &SpawnRequest) -> Result<ProcessHandle, SupervisorError> {
        if let Some(delay) = self.with_state(|state| state.spawn_delay) {
            thread::sleep(delay);
        }
        self.with_state(|state| {
            state.spawned.push(request.clone());
            if state.fail_spawns {
                return Err(SupervisorError::Spawn {
                    program: request.argv.first().cloned().unwrap_or_default(),
                    source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
                });
            }
            let handle = ProcessHandle {
                id: state.next_id,
                session_id: request.session_id.clone(),
                pid: state.next_pid,
                proc_started: Some(1_700_000_000),
            };
            state.next_id += 1;
            state.next_pid += 1;
            let exit = state.exit_on_spawn.map(|code| (Some(code), None));
            state.processes.insert(
                handle.id,
                FakeProcess {
                    handle: handle.clone(),
                    exit,
                    reported: false,
                },
            );
            Ok(handle)
        })
    }

    fn adopt(
        &self,
        session_id: &str,
        pid: u32,
        proc_started: Option<u64>,
    ) -> Option<ProcessHandle> {
        self.with_state(|state| {
            if !state.adoptable.contains(&pid) {
                return None;
            }
            let handle = ProcessHandle {
                id: state.next_id,
                session_id: session_id.to_string(),
                pid,
                proc_started,
            };
            state.next_id += 1;
            state.processes.insert(
                handle.id,
                FakeProcess {
                    handle: handle.clone(),
                    exit: None,
                    reported: false,
                },
            );
            Some(handle)
        })
    }

    fn poll_exit(&self, handle: &ProcessHandle) -> Option<ExitReport> {
        self.with_state(|state| {
            let process = state.processes.get_mut(&handle.id)?;
            let (code, signal) = process.exit?;
            if process.reported {
                return None;
            }
            process.reported = true;
            Some(ExitReport {
                handle_id: handle.id,
                session_id: handle.session_id.clone(),
                pid: handle.pid,
                code,
                signal,
            })
        })
    }

    fn signal_stop(&self, handle: &ProcessHandle) -> Result<(), SupervisorError> {
        self.with_state(|state| {
            if state.ignore_terminate {
                return;
            }
            if let Some(process) = state.processes.get_mut(&handle.id) {
                process.exit.get_or_insert((None, Some(libc::SIGTERM)));
            }
        });
        Ok(())
    }

    fn force_kill(&self, handle: &ProcessHandle) -> Result<(), SupervisorError> {
        self.with_state(|state| {
            state.kills += 1;
            if state.unkillable {
                return;
            }
            if let Some(process) = state.processes.get_mut(&handle.id) {
                process.exit.get_or_insert((None, Some(libc::SIGKILL)));
            }
        });
        Ok(())
    }

    fn write_input(&self, handle: &ProcessHandle, bytes: &[u8]) -> Result<(), SupervisorError> {
        self.with_state(|state| {
            let live = state
                .processes
                .get(&handle.id)
                .is_some_and(|process| process.exit.is_none());
            if !live {
                return Err(SupervisorError::NoInput);
            }
            state.input.extend_from_slice(bytes);
            Ok(())
        })
    }
}
