//! Process inspection and signalling helpers for the daemon.

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, System};

/// Seconds of slack between a recorded start time and the one sysinfo reports.
const START_TIME_TOLERANCE_SECS: u64 = 2;

pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    #[cfg(unix)]
    {
        // SAFETY: signal 0 performs the existence/permission check only.
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

pub fn get_process_start_time(pid: u32) -> Option<u64> {
    let mut sys = System::new();
    let sys_pid = Pid::from(pid as usize);
    sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
    sys.process(sys_pid).map(|process| process.start_time())
}

/// True when `pid` is alive and, if a start time was recorded, is still the
/// same process rather than a recycled pid. Zombies count as gone.
pub fn is_same_process(pid: u32, proc_started: Option<u64>) -> bool {
    if !is_pid_alive(pid) {
        return false;
    }
    let mut sys = System::new();
    let sys_pid = Pid::from(pid as usize);
    sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
    let Some(process) = sys.process(sys_pid) else {
        return proc_started.is_none();
    };
    if process.status() == ProcessStatus::Zombie {
        return false;
    }
    match proc_started {
        Some(expected) => process.start_time().abs_diff(expected) <= START_TIME_TOLERANCE_SECS,
        None => true,
    }
}

#[cfg(unix)]
pub fn send_signal(pid: u32, signal: i32) -> std::io::Result<()> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {}", pid),
        ));
    }
    // SAFETY: plain POSIX signal delivery to a positive pid.
    if unsafe { libc::kill(pid as i32, signal) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive_and_matches_itself() {
        let pid = std::process::id();
        assert!(is_pid_alive(pid));
        let started = get_process_start_time(pid);
        assert!(started.is_some());
        assert!(is_same_process(pid, started));
        assert!(!is_same_process(pid, started.map(|value| value + 3600)));
    }

    #[test]
    fn rejects_nonsense_pids() {
        assert!(!is_pid_alive(0));
        assert!(!is_pid_alive(u32::MAX));
        assert!(send_signal(0, libc::SIGTERM).is_err());
    }

    #[test]
    fn unreaped_child_is_not_the_same_process() {
        let mut child = std::process::Command::new("/bin/sh")
            .args(["-c", "exit 0"])
            .spawn()
            .expect("spawn");
        let pid = child.id();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while is_same_process(pid, None) && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(is_pid_alive(pid), "zombie still answers signal 0");
        assert!(!is_same_process(pid, None));
        child.wait().expect("reap");
    }
}
