//! Handles for managed processes.
//!
//! A [`ProcessHandle`] names one role, knows where its socket and pid file
//! live, and how to (re)launch it. The pid is stored atomically so any
//! thread can run liveness checks while the watchdog relaunches.

use std::ffi::OsString;
use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, Ordering};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::error::{PoolError, Result};
use crate::ipc::fd::clear_cloexec;
use crate::paths;
use crate::pidfile;

/// Send `sig` to `pid`, refusing pids below 1 so we never signal a group.
pub fn kill_pid(pid: i32, sig: impl Into<Option<Signal>>) -> Result<()> {
    if pid < 1 {
        return Err(PoolError::Sys(nix::errno::Errno::ESRCH));
    }
    signal::kill(Pid::from_raw(pid), sig)?;
    Ok(())
}

/// Zero-signal liveness check.
pub fn process_alive(pid: i32) -> bool {
    kill_pid(pid, None).is_ok()
}

/// Program and arguments used to start a role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Descriptor left open across exec in this child only.
    pub inherit_fd: Option<RawFd>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            inherit_fd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Keep `fd` open in the launched process. The caller's copy stays
    /// close-on-exec, so no other child sees it.
    pub fn with_inherited_fd(mut self, fd: RawFd) -> Self {
        self.inherit_fd = Some(fd);
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        if let Some(fd) = self.inherit_fd {
            // SAFETY: clear_cloexec only calls fcntl, which is
            // async-signal-safe, and touches no memory shared with the parent.
            unsafe {
                cmd.pre_exec(move || clear_cloexec(fd));
            }
        }
        cmd
    }
}

/// One managed process.
#[derive(Debug)]
pub struct ProcessHandle {
    /// Role name, also the pid file stem.
    name: String,
    socket_path: PathBuf,
    pid_path: PathBuf,
    launch: Option<LaunchSpec>,
    /// 0 when not launched or unknown.
    pid: AtomicI32,
    /// Unix second of the most recent relaunch (crash-loop guard).
    last_relaunch: AtomicI64,
    launches: AtomicU32,
}

impl ProcessHandle {
    /// A launchable role whose socket is named after it.
    pub fn role<P: AsRef<Path>>(socket_dir: P, name: &str, launch: LaunchSpec) -> Self {
        Self::new(socket_dir, name, name, Some(launch))
    }

    /// The parent itself, reachable on its `listener` socket.
    pub fn main<P: AsRef<Path>>(socket_dir: P) -> Self {
        Self::new(
            socket_dir,
            paths::MAIN_PROCNAME,
            paths::LISTENER_SOCKNAME,
            None,
        )
    }

    fn new<P: AsRef<Path>>(
        socket_dir: P,
        name: &str,
        sockname: &str,
        launch: Option<LaunchSpec>,
    ) -> Self {
        let socket_dir = socket_dir.as_ref();
        Self {
            name: name.to_string(),
            socket_path: paths::socket_path(socket_dir, sockname),
            pid_path: paths::pid_path(socket_dir, name),
            launch,
            pid: AtomicI32::new(0),
            last_relaunch: AtomicI64::new(0),
            launches: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn pid_path(&self) -> &Path {
        &self.pid_path
    }

    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::SeqCst)
    }

    pub fn set_pid(&self, pid: i32) {
        self.pid.store(pid, Ordering::SeqCst);
    }

    /// Known pid, falling back to the pid file when none was recorded.
    pub fn resolve_pid(&self) -> i32 {
        let pid = self.pid();
        if pid != 0 {
            return pid;
        }
        let pid = pidfile::read_pid(&self.pid_path);
        self.set_pid(pid);
        pid
    }

    pub fn is_alive(&self) -> bool {
        process_alive(self.resolve_pid())
    }

    /// How many times this role has been started.
    pub fn launch_count(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn last_relaunch(&self) -> i64 {
        self.last_relaunch.load(Ordering::SeqCst)
    }

    pub fn set_last_relaunch(&self, unix_secs: i64) {
        self.last_relaunch.store(unix_secs, Ordering::SeqCst);
    }

    /// Start the process and record its pid.
    pub fn launch(&self) -> Result<i32> {
        let spec = self.launch.as_ref().ok_or_else(|| PoolError::Spawn {
            role: self.name.clone(),
            reason: "no launch command".into(),
        })?;

        let child = spec.command().spawn().map_err(|e| PoolError::Spawn {
            role: self.name.clone(),
            reason: e.to_string(),
        })?;
        // The watchdog reaps via waitpid, so the Child is simply dropped.
        let pid = child.id() as i32;
        self.set_pid(pid);
        self.launches.fetch_add(1, Ordering::SeqCst);
        tracing::info!(role = %self.name, pid, "Launched process");
        Ok(pid)
    }

    /// Signal the process if it is still alive.
    pub fn signal(&self, sig: Signal) -> Result<()> {
        let pid = self.pid();
        if process_alive(pid) {
            kill_pid(pid, sig)?;
        }
        Ok(())
    }
}
