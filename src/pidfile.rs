//! Pid files for the parent and each role.
//!
//! A pid file holds the decimal process id and nothing else. At startup an
//! existing file naming a live process blocks the launch unless the caller
//! asked to kill the old instance.

use std::path::Path;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;

use crate::error::{PoolError, Result};
use crate::supervisor::process::{kill_pid, process_alive};

/// Read the pid stored at `path`, or 0 if missing or unparsable.
pub fn read_pid<P: AsRef<Path>>(path: P) -> i32 {
    std::fs::read_to_string(path.as_ref())
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// Write `pid` to `path`, dealing with a stale prior instance first.
pub fn write_pid<P: AsRef<Path>>(path: P, pid: i32, killold: bool) -> Result<()> {
    let path = path.as_ref();
    if path.exists() {
        tracing::info!(path = %path.display(), "Pid file exists");
        let oldpid = read_pid(path);
        if oldpid != pid && process_alive(oldpid) {
            if !killold {
                tracing::error!(
                    path = %path.display(),
                    pid = oldpid,
                    "Process still exists, start with --killold if you wish to kill it"
                );
                return Err(PoolError::AlreadyRunning {
                    name: path.display().to_string(),
                    pid: oldpid,
                });
            }
            kill_pid(oldpid, Signal::SIGKILL).map_err(|e| {
                tracing::error!(pid = oldpid, error = %e, "Unable to kill old process");
                e
            })?;
            tracing::warn!(path = %path.display(), pid = oldpid, "Killing off old process");
        }
    }
    std::fs::write(path, pid.to_string())?;
    Ok(())
}

/// Remove the pid file, ignoring a missing file.
pub fn remove_pid<P: AsRef<Path>>(path: P) {
    let path = path.as_ref();
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove pid file");
    }
}

/// Poll until `pid` is gone or `timeout` elapses. Returns whether it exited.
pub fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
    let start = Instant::now();
    while process_alive(pid) {
        if start.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    true
}
