//! Worker processes.
//!
//! Each role runs in its own process, started by the parent re-executing
//! this binary with `--internal-role <role>`. A role owns the socket named
//! after it in the socket directory and serves control messages there until
//! it is told to shut down or signalled.

pub mod connector;
pub mod generator;
pub mod runtime;
pub mod stratifier;

use std::os::unix::io::OwnedFd;
use std::path::PathBuf;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::ipc::unix::send_proc_or_stop;
use crate::supervisor::process::ProcessHandle;
use crate::supervisor::signals::forward_to_parent;
use crate::supervisor::{LocalShutdown, ShutdownReason};
use crate::{logging, paths, pidfile};

/// Pause after asking the parent to shut down before a failed role exits.
pub const FAILURE_EXIT_DELAY: Duration = Duration::from_secs(1);

/// The managed worker roles, in launch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Generator,
    Stratifier,
    Connector,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Generator, Role::Stratifier, Role::Connector];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Generator => "generator",
            Role::Stratifier => "stratifier",
            Role::Connector => "connector",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| PoolError::Config(format!("unknown role '{s}'")))
    }
}

/// Everything a role needs from the command line and config file.
#[derive(Debug)]
pub struct RoleContext {
    pub socket_dir: PathBuf,
    pub config: PoolConfig,
    pub killold: bool,
    /// Listening socket inherited across a handover (connector only).
    pub listen_fd: Option<OwnedFd>,
}

impl RoleContext {
    pub fn new(socket_dir: impl Into<PathBuf>, config: PoolConfig) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            config,
            killold: false,
            listen_fd: None,
        }
    }
}

/// Run `role` to completion and return the process exit code.
pub fn run_role(role: Role, ctx: RoleContext) -> i32 {
    let parent = ProcessHandle::main(&ctx.socket_dir);
    parent.set_pid(nix::unistd::getppid().as_raw());
    let local = RoleShutdown::new(&ctx.socket_dir, role.as_str());

    tracing::info!(role = %role, pid = std::process::id(), "Role starting");
    let ret = match role {
        Role::Generator => generator::run(ctx),
        Role::Stratifier => stratifier::run(ctx),
        Role::Connector => connector::run(ctx),
    };
    process_exit(&parent, role.as_str(), ret, &local)
}

/// Map a role's result to its exit code.
///
/// A failure asks the parent to shut the pool down, waits a moment so the
/// request is seen before this process disappears, and exits 1.
pub fn process_exit(
    parent: &ProcessHandle,
    name: &str,
    ret: Result<i32>,
    local: &dyn LocalShutdown,
) -> i32 {
    match ret {
        Ok(0) => {
            tracing::info!(role = name, "Child exiting normally");
            0
        }
        Ok(code) => {
            tracing::error!(role = name, code, "Child exiting with failure, shutting down");
            fail(parent, local)
        }
        Err(e) => {
            tracing::error!(role = name, error = %e, "Child failed, shutting down");
            fail(parent, local)
        }
    }
}

fn fail(parent: &ProcessHandle, local: &dyn LocalShutdown) -> i32 {
    send_proc_or_stop(parent, "shutdown", local);
    thread::sleep(FAILURE_EXIT_DELAY);
    1
}

/// Stop path of a role whose message to the parent was lost.
///
/// Signals the parent instead, removes this role's files and exits.
#[derive(Debug, Clone)]
pub struct RoleShutdown {
    socket_path: PathBuf,
    pid_path: PathBuf,
}

impl RoleShutdown {
    pub fn new(socket_dir: &std::path::Path, name: &str) -> Self {
        Self {
            socket_path: paths::socket_path(socket_dir, name),
            pid_path: paths::pid_path(socket_dir, name),
        }
    }

    /// Remove the role's socket and pid file.
    pub fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.socket_path);
        pidfile::remove_pid(&self.pid_path);
    }
}

impl LocalShutdown for RoleShutdown {
    fn request_local_shutdown(&self, reason: ShutdownReason) {
        tracing::warn!(%reason, "Role stopping");
        forward_to_parent(libc::SIGTERM);
        self.cleanup();
        logging::flush(Duration::from_millis(500));
        std::process::exit(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::unix::{UnixEndpoint, recv_unix_msg};
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[test]
    fn test_role_names_round_trip() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("listener".parse::<Role>().is_err());
    }

    struct Recorder(Mutex<Vec<ShutdownReason>>);

    impl LocalShutdown for Recorder {
        fn request_local_shutdown(&self, reason: ShutdownReason) {
            self.0.lock().unwrap().push(reason);
        }
    }

    #[test]
    fn test_clean_return_exits_zero_silently() {
        let tmp = tempdir().unwrap();
        let parent = ProcessHandle::main(tmp.path());
        let recorder = Recorder(Mutex::new(Vec::new()));
        assert_eq!(process_exit(&parent, "stratifier", Ok(0), &recorder), 0);
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failure_asks_parent_to_shut_down() {
        let tmp = tempdir().unwrap();
        let parent = ProcessHandle::main(tmp.path());
        parent.set_pid(std::process::id() as i32);
        let endpoint = UnixEndpoint::bind(parent.socket_path(), None).unwrap();
        let server = std::thread::spawn(move || {
            let stream = endpoint.accept().unwrap();
            recv_unix_msg(&stream, Some(Duration::from_secs(2))).unwrap()
        });

        let recorder = Recorder(Mutex::new(Vec::new()));
        let code = process_exit(&parent, "generator", Ok(2), &recorder);
        assert_eq!(code, 1);
        assert_eq!(server.join().unwrap(), "shutdown");
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failure_with_unreachable_parent_escalates() {
        let tmp = tempdir().unwrap();
        let parent = ProcessHandle::main(tmp.path());
        let recorder = Recorder(Mutex::new(Vec::new()));
        let err = PoolError::Config("boom".into());
        assert_eq!(process_exit(&parent, "connector", Err(err), &recorder), 1);
        assert_eq!(*recorder.0.lock().unwrap(), vec![ShutdownReason::SendFailure]);
    }
}
