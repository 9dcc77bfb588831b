//! camstream daemon entrypoint.
//!
//! Owns every encoder session on the host: reconciles persisted records on
//! boot, then serves newline-delimited JSON requests on a local socket until
//! asked to shut down.

use fs_err as fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::thread;
use tracing::{error, info, warn};

mod config;
mod db;
mod encoder;
mod error;
mod locks;
mod logging;
mod logs;
mod manager;
mod process;
mod server;
mod session_store;
mod supervisor;
#[cfg(test)]
mod testing;

use config::{DaemonConfig, DaemonPaths};
use db::Db;
use manager::{ManagerConfig, SessionManager};
use server::ServerContext;
use supervisor::{ExitReport, ProcessSupervisor};

fn main() {
    std::process::exit(run());
}

/// Returns the process exit code. The logging guard drops before exit so the
/// file layer is flushed.
fn run() -> i32 {
    let home = match config::home_dir() {
        Ok(home) => home,
        Err(err) => {
            let _logging_guard = logging::init(None);
            error!(error = %err, "Failed to resolve home directory");
            return 1;
        }
    };

    let config_path = config::default_config_path(&home);
    let loaded = config::load_config(&config_path);
    let config = loaded.as_ref().cloned().unwrap_or_default();
    let paths = config.resolve_paths(&home);
    let _logging_guard = logging::init(Some(&paths.daemon_log_dir));

    if let Err(err) = &loaded {
        warn!(error = %err, "Failed to load daemon config; using defaults");
    }

    if let Err(err) = prepare_dirs(&paths) {
        error!(error = %err, "Failed to create daemon directories");
        return 1;
    }

    let db = match Db::new(paths.db_path()) {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, "Failed to initialize session store");
            return 1;
        }
    };

    let (exit_tx, exit_rx) = mpsc::channel();
    let supervisor = Arc::new(ProcessSupervisor::new(
        exit_tx,
        config.supervisor.reap_interval(),
        config.encoder.interactive_stdin,
    ));
    let manager_config = ManagerConfig {
        encoder: config.encoder.clone(),
        supervisor: config.supervisor.clone(),
        session_log_dir: paths.session_log_dir.clone(),
    };

    let manager = match SessionManager::recover(Arc::new(db), supervisor, manager_config) {
        Ok((manager, report)) => {
            info!(
                adopted = report.adopted.len(),
                crashed = report.crashed.len(),
                "Session reconciliation complete"
            );
            manager
        }
        Err(err) => {
            error!(error = %err, "Startup reconciliation failed");
            return 1;
        }
    };
    spawn_exit_listener(Arc::clone(&manager), exit_rx);

    let listener = match bind_socket(&paths.socket) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %paths.socket.display(), "Failed to bind daemon socket");
            return 1;
        }
    };

    info!(
        path = %paths.socket.display(),
        pid = std::process::id(),
        "camstream daemon started"
    );

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    let context = Arc::new(ServerContext::new(
        Arc::clone(&manager),
        config.server.clone(),
        config.shutdown.stop_sessions,
        shutdown_tx,
    ));
    thread::spawn(move || server::serve(listener, context));

    if shutdown_rx.recv().is_err() {
        warn!("Shutdown channel closed unexpectedly");
    }
    shut_down(&manager, &config, &paths);
    0
}

fn shut_down(manager: &SessionManager, config: &DaemonConfig, paths: &DaemonPaths) {
    info!(
        stop_sessions = config.shutdown.stop_sessions,
        "Daemon shutting down"
    );
    if config.shutdown.stop_sessions {
        for (id, result) in manager.stop_all() {
            if let Err(err) = result {
                warn!(session_id = %id, error = %err, "Failed to stop session during shutdown");
            }
        }
    }
    if let Err(err) = fs::remove_file(&paths.socket) {
        warn!(error = %err, "Failed to remove daemon socket");
    }
}

fn spawn_exit_listener(manager: Arc<SessionManager>, exits: mpsc::Receiver<ExitReport>) {
    thread::spawn(move || {
        for report in exits {
            manager.apply_exit(report);
        }
    });
}

fn prepare_dirs(paths: &DaemonPaths) -> std::io::Result<()> {
    fs::create_dir_all(&paths.state_dir)?;
    fs::create_dir_all(&paths.session_log_dir)?;
    if let Some(parent) = paths.socket.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn bind_socket(socket_path: &Path) -> Result<UnixListener, String> {
    if socket_path.exists() {
        if UnixStream::connect(socket_path).is_ok() {
            return Err("Another daemon is already listening".to_string());
        }
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove stale socket: {}", err))?;
    }

    let listener = UnixListener::bind(socket_path).map_err(|err| err.to_string())?;
    fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
        .map_err(|err| format!("Failed to restrict socket permissions: {}", err))?;
    Ok(listener)
}
