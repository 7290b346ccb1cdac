//! Termination analysis and signal handling.
//!
//! The parent turns SIGTERM, SIGINT and SIGHUP into a shutdown request on its
//! [`Supervisor`]. Role processes ignore interactive signals, pass termination
//! signals up to the parent, and treat SIGUSR1 as the soft-stop request sent
//! during teardown.

use std::sync::Arc;
use std::thread;

use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::WaitStatus;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use signal_hook::iterator::Signals;

use super::process::kill_pid;
use super::{ShutdownReason, Supervisor};
use crate::error::Result;

/// Why a managed process went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Process is still running.
    StillAlive,
    /// Stopped, continued, or otherwise not a termination.
    Unknown,
}

impl TerminationReason {
    /// Exit status 0, which the watchdog treats as a controlled stop.
    pub fn is_clean_exit(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Whether the process is actually gone.
    pub fn is_termination(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Signaled(_))
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

/// Route the parent's termination signals into `sup`'s shutdown request.
pub fn spawn_parent_handler(sup: Arc<Supervisor>) -> Result<()> {
    let mut signals = Signals::new([SIGTERM, SIGINT, SIGHUP])?;
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            for sig in signals.forever() {
                tracing::warn!(
                    name = sup.name(),
                    signal = sig,
                    "Parent process received signal, shutting down"
                );
                sup.request_shutdown(ShutdownReason::Signal(sig));
            }
        })?;
    Ok(())
}

/// Signal setup for a role process.
///
/// `cleanup` runs once before the process exits with status 0.
pub fn install_child_handlers<F>(cleanup: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    // SAFETY: installing SIG_IGN runs no code in signal context.
    unsafe {
        signal::signal(Signal::SIGINT, SigHandler::SigIgn)?;
        signal::signal(Signal::SIGQUIT, SigHandler::SigIgn)?;
    }

    let mut signals = Signals::new([SIGTERM, SIGHUP, SIGUSR1])?;
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                if sig != SIGUSR1 {
                    forward_to_parent(sig);
                }
                cleanup();
                crate::logging::flush(std::time::Duration::from_millis(500));
                std::process::exit(0);
            }
        })?;
    Ok(())
}

/// Pass `sig` on to the parent so it can shut everything down.
pub fn forward_to_parent(sig: i32) {
    let ppid = nix::unistd::getppid().as_raw();
    tracing::warn!(
        signal = sig,
        parent = ppid,
        "Child process received signal, forwarding signal to main process"
    );
    match Signal::try_from(sig) {
        Ok(signal) => {
            if let Err(e) = kill_pid(ppid, signal) {
                tracing::error!(parent = ppid, error = %e, "Failed to forward signal");
            }
        }
        Err(e) => tracing::error!(signal = sig, error = %e, "Cannot forward unknown signal"),
    }
}
