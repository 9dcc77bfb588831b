//! Session Manager.
//!
//! The only writer of session records and device claims. Each session id has
//! a `SessionCell`: `op` serializes start/stop/restart on that id, while the
//! short-lived `live` lock guards the current process handle. Exit handling,
//! reads and attach only ever take `live`, so they never queue behind a slow
//! stop.
//!
//! Store writes that race with exit handling (launch confirmation, exit
//! persistence) are made while holding `live`, which orders them.

use camstream_protocol::{SessionRecord, SessionStatus, StartParams, TransitionRecord};
use chrono::Utc;
use rand::RngCore;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{EncoderConfig, SupervisorConfig};
use crate::encoder::build_argv;
use crate::error::{ControlError, RecoveryError, StoreError};
use crate::locks::{lock_unpoisoned, DeviceLocks, LockConflict};
use crate::logs::{tail_and_follow, tail_lines, LogFollower};
use crate::process::is_same_process;
use crate::session_store::{SessionStore, StatusUpdate};
use crate::supervisor::{ExitReport, ProcessHandle, SpawnRequest, Supervisor};

const LAUNCH_FAILURE_TAIL_LINES: usize = 20;
const CONFIRM_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub encoder: EncoderConfig,
    pub supervisor: SupervisorConfig,
    pub session_log_dir: PathBuf,
}

struct LiveProcess {
    handle: ProcessHandle,
    device: String,
    /// Still inside the launch confirmation window.
    launching: bool,
    stop_requested: bool,
    /// The exit belongs to a restart; keep the device claim.
    restart_pending: bool,
}

#[derive(Default)]
struct SessionCell {
    op: Mutex<()>,
    live: Mutex<Option<LiveProcess>>,
    exited: Condvar,
    /// Reports that arrived before `launch` registered their handle. Only
    /// touched while `live` is held.
    early_exits: Mutex<Vec<ExitReport>>,
}

impl SessionCell {
    fn live(&self) -> MutexGuard<'_, Option<LiveProcess>> {
        lock_unpoisoned(&self.live)
    }

    fn live_handle(&self) -> Option<ProcessHandle> {
        self.live().as_ref().map(|process| process.handle.clone())
    }

    fn holds(&self, handle_id: u64) -> bool {
        self.live()
            .as_ref()
            .is_some_and(|process| process.handle.id == handle_id)
    }

    /// Takes the early report for `handle_id`, dropping any left over from
    /// earlier launches. Call with `live` held.
    fn take_early_exit(&self, handle_id: u64) -> Option<ExitReport> {
        lock_unpoisoned(&self.early_exits)
            .drain(..)
            .find(|report| report.handle_id == handle_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub total: usize,
    pub active: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub adopted: Vec<String>,
    pub crashed: Vec<String>,
}

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    supervisor: Arc<dyn Supervisor>,
    locks: DeviceLocks,
    cells: Mutex<HashMap<String, Arc<SessionCell>>>,
    config: ManagerConfig,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        supervisor: Arc<dyn Supervisor>,
        locks: DeviceLocks,
        config: ManagerConfig,
    ) -> Self {
        Self {
            store,
            supervisor,
            locks,
            cells: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Reconciles persisted records with the processes that actually exist,
    /// rebuilds the device lock table and returns a ready manager.
    ///
    /// Exit reports for adopted processes are queued on the supervisor's
    /// channel; start the exit listener once this returns.
    pub fn recover(
        store: Arc<dyn SessionStore>,
        supervisor: Arc<dyn Supervisor>,
        config: ManagerConfig,
    ) -> Result<(Arc<Self>, RecoveryReport), RecoveryError> {
        let mut report = RecoveryReport::default();
        let mut survivors = Vec::new();

        for record in store.list()? {
            let reason = match record.status {
                SessionStatus::Stopped | SessionStatus::Crashed => continue,
                SessionStatus::Starting => "daemon restarted during launch",
                SessionStatus::Running | SessionStatus::Stopping => {
                    match record.pid {
                        Some(pid) if is_same_process(pid, record.proc_started) => {
                            survivors.push(record);
                            continue;
                        }
                        _ => "process not found after daemon restart",
                    }
                }
            };
            mark_crashed_at_recovery(store.as_ref(), &record, reason)?;
            report.crashed.push(record.id);
        }

        let locks = DeviceLocks::rebuild(&store.list()?).map_err(RecoveryError::Corruption)?;
        let manager = Arc::new(Self::new(store, supervisor, locks, config));

        for record in survivors {
            if manager.adopt(&record)? {
                if record.status == SessionStatus::Stopping {
                    let manager = Arc::clone(&manager);
                    let id = record.id.clone();
                    thread::spawn(move || {
                        if let Err(err) = manager.stop(&id) {
                            warn!(session_id = %id, error = %err, "Failed to finish interrupted stop");
                        }
                    });
                }
                report.adopted.push(record.id);
            } else {
                report.crashed.push(record.id);
            }
        }

        info!(
            adopted = report.adopted.len(),
            crashed = report.crashed.len(),
            "Session reconciliation complete"
        );
        Ok((manager, report))
    }

    fn adopt(&self, record: &SessionRecord) -> Result<bool, StoreError> {
        let cell = self.cell(&record.id);
        let mut live = cell.live();
        let handle = record.pid.and_then(|pid| {
            self.supervisor
                .adopt(&record.id, pid, record.proc_started)
        });
        match handle {
            Some(handle) => {
                *live = Some(LiveProcess {
                    handle,
                    device: record.device.clone(),
                    launching: false,
                    stop_requested: record.status == SessionStatus::Stopping,
                    restart_pending: false,
                });
                Ok(true)
            }
            None => {
                drop(live);
                mark_crashed_at_recovery(
                    self.store.as_ref(),
                    record,
                    "process not found after daemon restart",
                )?;
                self.locks.release_if_held(&record.device, &record.id);
                Ok(false)
            }
        }
    }

    pub fn start(&self, params: &StartParams) -> Result<SessionRecord, ControlError> {
        let (alias, launch_spec) = params.validate().map_err(ControlError::Validation)?;
        let id = new_session_id();

        self.locks
            .acquire(&launch_spec.device, &id)
            .map_err(conflict)?;

        let cell = self.cell(&id);
        let _op = lock_unpoisoned(&cell.op);

        let now = Utc::now().to_rfc3339();
        let record = SessionRecord {
            id: id.clone(),
            alias,
            device: launch_spec.device.clone(),
            argv: build_argv(&self.config.encoder, &launch_spec),
            launch_spec,
            status: SessionStatus::Starting,
            pid: None,
            proc_started: None,
            log_path: self
                .config
                .session_log_dir
                .join(format!("{}.log", id))
                .to_string_lossy()
                .into_owned(),
            exit_code: None,
            last_error: None,
            restart_count: 0,
            created_at: now.clone(),
            started_at: None,
            stopped_at: None,
            updated_at: now,
        };

        if let Err(err) = self.store.put(&record) {
            self.locks.release_if_held(&record.device, &id);
            self.forget(&id);
            error!(session_id = %id, error = %err, "Failed to persist new session");
            return Err(err.into());
        }
        info!(session_id = %id, alias = %record.alias, device = %record.device, "Session created");

        self.launch(&cell, &record)
    }

    pub fn stop(&self, id: &str) -> Result<SessionRecord, ControlError> {
        self.existing(id)?;
        let cell = self.cell(id);
        let _op = lock_unpoisoned(&cell.op);
        self.stop_locked(&cell, id, false)
    }

    pub fn restart(&self, id: &str) -> Result<SessionRecord, ControlError> {
        self.existing(id)?;
        let cell = self.cell(id);
        let _op = lock_unpoisoned(&cell.op);

        let record = self.existing(id)?;
        if record.status.is_terminal() {
            self.locks.acquire(&record.device, id).map_err(conflict)?;
        } else if let Err(err) = self.stop_locked(&cell, id, true) {
            self.abandon_restart(&cell, &record);
            return Err(err);
        }

        let relaunching = match self.store.update_status(id, &StatusUpdate::relaunching()) {
            Ok(record) => record,
            Err(err) => {
                self.locks.release_if_held(&record.device, id);
                return Err(err.into());
            }
        };
        info!(session_id = %id, restart_count = relaunching.restart_count, "Restarting session");
        self.launch(&cell, &relaunching)
    }

    pub fn status(&self, id: &str) -> Result<(SessionRecord, Vec<TransitionRecord>), ControlError> {
        self.refresh(id);
        let record = self.existing(id)?;
        let transitions = self.store.transitions(id)?;
        Ok((record, transitions))
    }

    pub fn get(&self, id: &str) -> Result<SessionRecord, ControlError> {
        self.refresh(id);
        self.existing(id)
    }

    pub fn list(&self) -> Result<Vec<SessionRecord>, ControlError> {
        let ids: Vec<String> = lock_unpoisoned(&self.cells).keys().cloned().collect();
        for id in ids {
            self.refresh(&id);
        }
        Ok(self.store.list()?)
    }

    /// Last `lines` complete log lines plus a follower picking up after them.
    pub fn open_log(
        &self,
        id: &str,
        lines: usize,
    ) -> Result<(SessionRecord, Vec<String>, LogFollower), ControlError> {
        let record = self.existing(id)?;
        let (tail, follower) =
            tail_and_follow(Path::new(&record.log_path), lines).map_err(|source| {
                ControlError::LogRead {
                    path: PathBuf::from(&record.log_path),
                    source,
                }
            })?;
        Ok((record, tail, follower))
    }

    /// The live process of a session, for attach.
    pub fn live_process(&self, id: &str) -> Result<(SessionRecord, ProcessHandle), ControlError> {
        let record = self.get(id)?;
        self.cells_get(id)
            .and_then(|cell| cell.live_handle())
            .map(|handle| (record, handle))
            .ok_or_else(|| ControlError::NotRunning(id.to_string()))
    }

    pub fn send_input(&self, id: &str, bytes: &[u8]) -> Result<(), ControlError> {
        let handle = self
            .cells_get(id)
            .and_then(|cell| cell.live_handle())
            .ok_or_else(|| ControlError::NotRunning(id.to_string()))?;
        self.supervisor.write_input(&handle, bytes)?;
        Ok(())
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.refresh(id);
        self.cells_get(id)
            .is_some_and(|cell| cell.live().is_some())
    }

    pub fn devices(&self) -> BTreeMap<String, String> {
        self.locks.snapshot()
    }

    pub fn summary(&self) -> Result<SessionSummary, ControlError> {
        let records = self.store.list()?;
        Ok(SessionSummary {
            total: records.len(),
            active: records
                .iter()
                .filter(|record| !record.status.is_terminal())
                .count(),
        })
    }

    /// Stops every non-terminal session in parallel.
    pub fn stop_all(&self) -> Vec<(String, Result<SessionRecord, ControlError>)> {
        let records = match self.store.list() {
            Ok(records) => records,
            Err(err) => {
                error!(error = %err, "Failed to list sessions for shutdown");
                return Vec::new();
            }
        };
        let ids: Vec<String> = records
            .into_iter()
            .filter(|record| !record.status.is_terminal())
            .map(|record| record.id)
            .collect();

        thread::scope(|scope| {
            let workers: Vec<_> = ids
                .iter()
                .map(|id| scope.spawn(move || (id.clone(), self.stop(id))))
                .collect();
            workers
                .into_iter()
                .filter_map(|worker| worker.join().ok())
                .collect()
        })
    }

    /// Consumes one exit report. A report for a handle the session does not
    /// hold is parked until `launch` registers that handle; reports for
    /// handles that are never registered are dropped at the next launch.
    pub fn apply_exit(&self, report: ExitReport) {
        let Some(cell) = self.cells_get(&report.session_id) else {
            debug!(session_id = %report.session_id, "Exit report for unknown session");
            return;
        };
        let mut live = cell.live();
        if !live
            .as_ref()
            .is_some_and(|process| process.handle.id == report.handle_id)
        {
            debug!(session_id = %report.session_id, pid = report.pid, "Parking exit report for unregistered process");
            lock_unpoisoned(&cell.early_exits).push(report);
            return;
        }
        let Some(process) = live.take() else {
            return;
        };

        let id = report.session_id.as_str();
        let now = Utc::now().to_rfc3339();
        let update = if process.stop_requested {
            StatusUpdate::stopped(report.code, now.clone())
        } else if process.launching {
            StatusUpdate::crashed(
                report.code,
                format!("encoder {} during launch", report.describe()),
                now.clone(),
            )
        } else {
            StatusUpdate::crashed(report.code, format!("encoder {}", report.describe()), now.clone())
        };

        append_log_line(
            &self.log_path_for(id),
            &format!("=== {} session {} {} ===", now, id, report.describe()),
        );

        match self.store.update_status(id, &update) {
            Ok(record) => {
                if update.status == SessionStatus::Crashed {
                    warn!(session_id = %id, pid = report.pid, reason = ?record.last_error, "Session crashed");
                } else {
                    info!(session_id = %id, pid = report.pid, "Session stopped");
                }
                if !process.restart_pending {
                    self.locks.release_if_held(&process.device, id);
                }
            }
            Err(err) => {
                // The record still claims the device, so the claim stays too.
                // A later stop or a daemon restart settles both.
                error!(session_id = %id, error = %err, "Failed to persist session exit");
            }
        }
        drop(live);
        cell.exited.notify_all();
    }

    fn launch(&self, cell: &SessionCell, record: &SessionRecord) -> Result<SessionRecord, ControlError> {
        let request = SpawnRequest {
            session_id: record.id.clone(),
            argv: record.argv.clone(),
            log_path: PathBuf::from(&record.log_path),
        };

        let handle = match self.spawn_bounded(request) {
            Ok(handle) => handle,
            Err(reason) => return Err(self.fail_launch(record, reason)),
        };
        let early_exit = {
            let mut live = cell.live();
            *live = Some(LiveProcess {
                handle: handle.clone(),
                device: record.device.clone(),
                launching: true,
                stop_requested: false,
                restart_pending: false,
            });
            cell.take_early_exit(handle.id)
        };
        if let Some(report) = early_exit {
            self.apply_exit(report);
        }

        let deadline = Instant::now() + self.config.supervisor.launch_confirm();
        loop {
            if let Some(report) = self.supervisor.poll_exit(&handle) {
                self.apply_exit(report);
            }
            if !cell.holds(handle.id) {
                return Err(self.launch_failed(&record.id));
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(CONFIRM_POLL_INTERVAL));
        }

        let mut live = cell.live();
        let Some(process) = live
            .as_mut()
            .filter(|process| process.handle.id == handle.id)
        else {
            drop(live);
            return Err(self.launch_failed(&record.id));
        };
        let update = StatusUpdate::running(handle.pid, handle.proc_started, Utc::now().to_rfc3339());
        let persisted = self.store.update_status(&record.id, &update);
        match persisted {
            Ok(running) => {
                process.launching = false;
                info!(session_id = %record.id, pid = handle.pid, "Session running");
                Ok(running)
            }
            Err(err) => {
                // An unrecorded process must not keep running.
                process.stop_requested = true;
                drop(live);
                error!(session_id = %record.id, error = %err, "Failed to record running session");
                let _ = self.supervisor.force_kill(&handle);
                self.wait_for_exit(cell, &handle, self.config.supervisor.kill_wait());
                Err(err.into())
            }
        }
    }

    /// Runs `spawn` on a helper thread so a hung launch cannot hold the
    /// session's `op` lock past `launch_timeout`.
    fn spawn_bounded(&self, request: SpawnRequest) -> Result<ProcessHandle, String> {
        let (tx, rx) = mpsc::channel();
        let supervisor = Arc::clone(&self.supervisor);
        thread::spawn(move || {
            let result = supervisor.spawn(&request);
            if let Err(mpsc::SendError(Ok(handle))) = tx.send(result) {
                warn!(
                    session_id = %request.session_id,
                    pid = handle.pid,
                    "Encoder launched after the launch timeout; killing it"
                );
                let _ = supervisor.force_kill(&handle);
            }
        });

        let timeout = self.config.supervisor.launch_timeout();
        match rx.recv_timeout(timeout) {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(err)) => Err(err.to_string()),
            Err(RecvTimeoutError::Timeout) => Err(format!(
                "encoder did not launch within {}ms",
                timeout.as_millis()
            )),
            Err(RecvTimeoutError::Disconnected) => {
                Err("launch thread ended without a result".to_string())
            }
        }
    }

    fn fail_launch(&self, record: &SessionRecord, reason: String) -> ControlError {
        warn!(session_id = %record.id, reason = %reason, "Encoder launch failed");
        append_log_line(
            Path::new(&record.log_path),
            &format!("=== {} launch failed: {} ===", Utc::now().to_rfc3339(), reason),
        );
        let update = StatusUpdate::crashed(None, reason.clone(), Utc::now().to_rfc3339());
        match self.store.update_status(&record.id, &update) {
            Ok(_) => {
                self.locks.release_if_held(&record.device, &record.id);
            }
            Err(err) => {
                // Same as an unpersisted exit: the record still claims the
                // device until a stop or a daemon restart settles it.
                error!(session_id = %record.id, error = %err, "Failed to record launch failure");
            }
        }
        ControlError::LaunchFailed {
            id: record.id.clone(),
            reason,
            log_tail: tail_lines(Path::new(&record.log_path), LAUNCH_FAILURE_TAIL_LINES)
                .unwrap_or_default(),
        }
    }

    /// Launch failure for a process that exited inside the confirm window;
    /// `apply_exit` has already recorded it.
    fn launch_failed(&self, id: &str) -> ControlError {
        let record = self.store.get(id).ok().flatten();
        let reason = record
            .as_ref()
            .and_then(|record| record.last_error.clone())
            .unwrap_or_else(|| "encoder exited during launch".to_string());
        let log_tail = record
            .map(|record| {
                tail_lines(Path::new(&record.log_path), LAUNCH_FAILURE_TAIL_LINES)
                    .unwrap_or_default()
            })
            .unwrap_or_default();
        ControlError::LaunchFailed {
            id: id.to_string(),
            reason,
            log_tail,
        }
    }

    fn stop_locked(
        &self,
        cell: &SessionCell,
        id: &str,
        for_restart: bool,
    ) -> Result<SessionRecord, ControlError> {
        let record = self.existing(id)?;
        if record.status.is_terminal() {
            return Err(ControlError::AlreadyStopped(id.to_string()));
        }

        let handle = {
            let mut live = cell.live();
            match live.as_mut() {
                Some(process) => {
                    let update = StatusUpdate::stopping(process.handle.pid, process.handle.proc_started);
                    self.store.update_status(id, &update)?;
                    process.stop_requested = true;
                    process.restart_pending = for_restart;
                    process.handle.clone()
                }
                None => {
                    // Non-terminal on disk with nothing running: an exit that
                    // could not be persisted earlier.
                    drop(live);
                    let stopped = self.store.update_status(
                        id,
                        &StatusUpdate::stopped(record.exit_code, Utc::now().to_rfc3339()),
                    )?;
                    if !for_restart {
                        self.locks.release_if_held(&record.device, id);
                    }
                    return Ok(stopped);
                }
            }
        };

        info!(session_id = %id, pid = handle.pid, "Stopping session");
        if let Err(err) = self.supervisor.signal_stop(&handle) {
            warn!(session_id = %id, error = %err, "Failed to deliver stop signal");
        }
        if self.wait_for_exit(cell, &handle, self.config.supervisor.stop_grace()) {
            return self.existing(id);
        }

        warn!(
            session_id = %id,
            pid = handle.pid,
            grace_ms = self.config.supervisor.stop_grace_ms,
            "Encoder ignored stop signal; killing"
        );
        if let Err(err) = self.supervisor.force_kill(&handle) {
            warn!(session_id = %id, error = %err, "Failed to deliver kill signal");
        }
        if self.wait_for_exit(cell, &handle, self.config.supervisor.kill_wait()) {
            return self.existing(id);
        }

        Err(ControlError::StopTimeout {
            id: id.to_string(),
            waited_ms: self.config.supervisor.kill_wait_ms,
        })
    }

    /// After a failed restart stop, put the claim back the way a plain stop
    /// would leave it.
    fn abandon_restart(&self, cell: &SessionCell, record: &SessionRecord) {
        let mut live = cell.live();
        match live.as_mut() {
            Some(process) => process.restart_pending = false,
            None => {
                drop(live);
                let settled = self
                    .store
                    .get(&record.id)
                    .ok()
                    .flatten()
                    .is_some_and(|current| current.status.is_terminal());
                if settled {
                    self.locks.release_if_held(&record.device, &record.id);
                }
            }
        }
    }

    /// Waits until the session no longer holds `handle`. Polls the supervisor
    /// inline so progress does not depend on the exit listener alone.
    fn wait_for_exit(&self, cell: &SessionCell, handle: &ProcessHandle, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let interval = self.config.supervisor.reap_interval();
        loop {
            if let Some(report) = self.supervisor.poll_exit(handle) {
                self.apply_exit(report);
            }
            let live = cell.live();
            if !live
                .as_ref()
                .is_some_and(|process| process.handle.id == handle.id)
            {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let _ = cell.exited.wait_timeout(live, (deadline - now).min(interval));
        }
    }

    fn refresh(&self, id: &str) {
        let Some(handle) = self.cells_get(id).and_then(|cell| cell.live_handle()) else {
            return;
        };
        if let Some(report) = self.supervisor.poll_exit(&handle) {
            self.apply_exit(report);
        }
    }

    fn existing(&self, id: &str) -> Result<SessionRecord, ControlError> {
        self.store
            .get(id)?
            .ok_or_else(|| ControlError::NotFound(id.to_string()))
    }

    fn cell(&self, id: &str) -> Arc<SessionCell> {
        Arc::clone(
            lock_unpoisoned(&self.cells)
                .entry(id.to_string())
                .or_default(),
        )
    }

    fn cells_get(&self, id: &str) -> Option<Arc<SessionCell>> {
        lock_unpoisoned(&self.cells).get(id).cloned()
    }

    fn forget(&self, id: &str) {
        lock_unpoisoned(&self.cells).remove(id);
    }

    fn log_path_for(&self, id: &str) -> PathBuf {
        self.config.session_log_dir.join(format!("{}.log", id))
    }
}

fn new_session_id() -> String {
    let mut random = rand::thread_rng();
    format!(
        "ses-{}-{:016x}",
        Utc::now().timestamp_millis(),
        random.next_u64()
    )
}

fn conflict(err: LockConflict) -> ControlError {
    ControlError::Conflict {
        device: err.device,
        holder: err.holder,
    }
}

fn mark_crashed_at_recovery(
    store: &dyn SessionStore,
    record: &SessionRecord,
    reason: &str,
) -> Result<(), StoreError> {
    warn!(session_id = %record.id, status = record.status.as_str(), reason, "Reconciling session");
    store.update_status(
        &record.id,
        &StatusUpdate::crashed(record.exit_code, reason, Utc::now().to_rfc3339()),
    )?;
    append_log_line(
        Path::new(&record.log_path),
        &format!("=== {} {} ===", Utc::now().to_rfc3339(), reason),
    );
    Ok(())
}

fn append_log_line(path: &Path, line: &str) {
    if let Some(parent) = path.parent() {
        let _ = fs_err::create_dir_all(parent);
    }
    let result = fs_err::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{}", line));
    if let Err(err) = result {
        debug!(path = %path.display(), error = %err, "Failed to append to session log");
    }
}
