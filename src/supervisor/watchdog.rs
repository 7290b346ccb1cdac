//! Child watchdog with crash-loop protection.
//!
//! The watchdog blocks on "any child exited". A role that exits with status 0
//! is taken as a controlled stop of the whole pool. A role that dies any
//! other way is relaunched, unless it was already relaunched within the same
//! wall-clock second, which counts as a crash loop. A child that matches no
//! role is fatal. Every path that leaves the loop shuts the pool down.

use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use super::signals::{TerminationReason, analyze_wait_status};
use super::{ShutdownReason, Supervisor};
use crate::ipc::unix;

/// Delay before the first wait, giving roles time to start.
const STARTUP_DELAY: Duration = Duration::from_secs(1);

/// Back-off while there are no children to wait for.
const NO_CHILD_BACKOFF: Duration = Duration::from_millis(100);

/// What to do about one reaped child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The role exited cleanly; stop the pool.
    ControlledStop,
    /// Start the role again.
    Relaunch,
    /// Second death within one second; stop the pool.
    CrashLoop,
    /// Pid belongs to no role; stop the pool.
    UnknownChild,
    /// Not a termination, or a child we spawned detached.
    Ignore,
}

/// Decide how to react to a child's termination.
///
/// `last_relaunch` is the role's previous relaunch second, `None` for a pid
/// that matches no role.
pub fn assess(reason: &TerminationReason, last_relaunch: Option<i64>, now: i64) -> Verdict {
    if !reason.is_termination() {
        return Verdict::Ignore;
    }
    let Some(last) = last_relaunch else {
        return Verdict::UnknownChild;
    };
    if reason.is_clean_exit() {
        Verdict::ControlledStop
    } else if now == last {
        Verdict::CrashLoop
    } else {
        Verdict::Relaunch
    }
}

fn sleep_unless_cancelled(sup: &Supervisor, total: Duration) -> bool {
    let step = Duration::from_millis(50);
    let mut slept = Duration::ZERO;
    while slept < total {
        if sup.watchdog_cancelled() {
            return false;
        }
        thread::sleep(step);
        slept += step;
    }
    !sup.watchdog_cancelled()
}

/// Watchdog thread body.
pub(crate) fn run(sup: &Supervisor) {
    let started = chrono::Utc::now().timestamp();
    for pi in sup.processes() {
        pi.set_last_relaunch(started);
    }
    tracing::debug!("Watchdog thread started");

    if !sleep_unless_cancelled(sup, STARTUP_DELAY) {
        return;
    }

    loop {
        if sup.watchdog_cancelled() {
            return;
        }
        let status = match waitpid(Pid::from_raw(-1), None) {
            Ok(status) => status,
            Err(Errno::ECHILD) => {
                thread::sleep(NO_CHILD_BACKOFF);
                continue;
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                tracing::error!(error = %e, "waitpid failed in watchdog");
                break;
            }
        };
        if sup.watchdog_cancelled() {
            return;
        }
        let Some(pid) = status.pid().map(Pid::as_raw) else {
            continue;
        };
        if sup.take_detached(pid) {
            tracing::info!(pid, "Detached restart process exited");
            continue;
        }

        let reason = analyze_wait_status(status);
        let now = chrono::Utc::now().timestamp();
        let pi = sup.process_by_pid(pid);
        match assess(&reason, pi.map(|p| p.last_relaunch()), now) {
            Verdict::Ignore => continue,
            Verdict::ControlledStop => {
                if let Some(pi) = pi {
                    tracing::warn!(process = pi.name(), %reason, "Child process exited, terminating!");
                }
                break;
            }
            Verdict::CrashLoop => {
                tracing::error!(pid, %reason, "Respawning processes too fast, exiting!");
                break;
            }
            Verdict::UnknownChild => {
                tracing::error!(pid, %reason, "Unknown child process dead, exiting!");
                break;
            }
            Verdict::Relaunch => {
                let Some(pi) = pi else { break };
                tracing::error!(process = pi.name(), %reason, "Process dead! Relaunching");
                pi.set_last_relaunch(now);
                match sup.relaunch(pi) {
                    Ok(true) => {}
                    Ok(false) => return,
                    Err(e) => {
                        tracing::error!(process = pi.name(), error = %e, "Relaunch failed");
                        break;
                    }
                }
            }
        }
    }

    if sup.watchdog_cancelled() {
        return;
    }
    sup.request_shutdown(ShutdownReason::Watchdog);
    unix::send_proc_or_stop(sup.main(), "shutdown", sup);
}
