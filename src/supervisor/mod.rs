//! Process supervision for the pool.
//!
//! The [`Supervisor`] is the one process-wide context of the parent. It owns
//! the table of managed roles, the control-plane listener thread and the
//! watchdog thread, and drives every shutdown through one state machine:
//!
//! ```text
//! Running -> Requested(reason) -> TearingDown -> Stopped
//! ```
//!
//! Requests come from the listener's `shutdown` command or a failed accept,
//! from the watchdog, from the parent's signal thread, and from failed
//! one-way sends. Whatever
//! the source, [`Supervisor::teardown`] is the only path that stops children.

pub mod handover;
pub mod listener;
pub mod process;
pub mod signals;
pub mod watchdog;

use std::ffi::OsString;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Gid, Pid};

use crate::error::{PoolError, Result};
use crate::ipc::unix::{self, UnixEndpoint};
use crate::pidfile;
use process::{LaunchSpec, ProcessHandle};

/// Pause between the soft stop and the kill during teardown.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(1);

/// How long teardown waits for the watchdog thread to notice cancellation.
const WATCHDOG_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// What asked the pool to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// `shutdown` on the control-plane socket.
    ControlCommand,
    /// Controlled stop, crash loop, or unknown child seen by the watchdog.
    Watchdog,
    /// SIGTERM, SIGINT or SIGHUP delivered to the parent.
    Signal(i32),
    /// A one-way control message could not be delivered.
    SendFailure,
    /// The control-plane socket stopped accepting connections.
    ListenerFailure,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ControlCommand => write!(f, "shutdown command"),
            Self::Watchdog => write!(f, "watchdog"),
            Self::Signal(sig) => write!(f, "signal {}", sig),
            Self::SendFailure => write!(f, "failed control message"),
            Self::ListenerFailure => write!(f, "listener failure"),
        }
    }
}

/// Shutdown progress of the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Requested(ShutdownReason),
    TearingDown,
    Stopped,
}

/// Whatever the local process does when it must stop.
///
/// In the parent this requests teardown; in a role it forwards a termination
/// signal to the parent and exits.
pub trait LocalShutdown {
    fn request_local_shutdown(&self, reason: ShutdownReason);
}

/// Construction parameters for a [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub name: String,
    pub socket_dir: PathBuf,
    pub gid: Option<Gid>,
    pub roles: Vec<(String, LaunchSpec)>,
    /// argv of this instance, replayed by `restart`.
    pub restart_args: Vec<OsString>,
    /// Whether this instance was itself started for handover.
    pub handover: bool,
    pub grace: Duration,
}

impl SupervisorOptions {
    pub fn new(name: impl Into<String>, socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            socket_dir: socket_dir.into(),
            gid: None,
            roles: Vec::new(),
            restart_args: Vec::new(),
            handover: false,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_role(mut self, name: &str, launch: LaunchSpec) -> Self {
        self.roles.push((name.to_string(), launch));
        self
    }

    pub fn with_gid(mut self, gid: Option<Gid>) -> Self {
        self.gid = gid;
        self
    }

    pub fn with_restart_args(mut self, args: Vec<OsString>, handover: bool) -> Self {
        self.restart_args = args;
        self.handover = handover;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

/// Process-wide context of the parent.
pub struct Supervisor {
    name: String,
    socket_dir: PathBuf,
    gid: Option<Gid>,
    main: ProcessHandle,
    processes: Vec<ProcessHandle>,
    restart_args: Vec<OsString>,
    handover: bool,
    grace: Duration,
    /// Set under this lock before teardown signals anyone; relaunches take
    /// the same lock.
    watchdog_cancelled: Mutex<bool>,
    /// Pids of detached restart children, which the watchdog must not treat
    /// as strangers.
    detached: Mutex<Vec<i32>>,
    state: Mutex<ShutdownState>,
    state_changed: Condvar,
    listener_stop: AtomicBool,
    listener_thread: Mutex<Option<JoinHandle<()>>>,
    watchdog_thread: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Supervisor {
    pub fn new(options: SupervisorOptions) -> Arc<Self> {
        let main = ProcessHandle::main(&options.socket_dir);
        main.set_pid(std::process::id() as i32);
        let processes = options
            .roles
            .into_iter()
            .map(|(name, launch)| ProcessHandle::role(&options.socket_dir, &name, launch))
            .collect();

        Arc::new(Self {
            name: options.name,
            socket_dir: options.socket_dir,
            gid: options.gid,
            main,
            processes,
            restart_args: options.restart_args,
            handover: options.handover,
            grace: options.grace,
            watchdog_cancelled: Mutex::new(false),
            detached: Mutex::new(Vec::new()),
            state: Mutex::new(ShutdownState::Running),
            state_changed: Condvar::new(),
            listener_stop: AtomicBool::new(false),
            listener_thread: Mutex::new(None),
            watchdog_thread: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    /// Handle addressing this process's own listener.
    pub fn main(&self) -> &ProcessHandle {
        &self.main
    }

    pub fn processes(&self) -> &[ProcessHandle] {
        &self.processes
    }

    pub fn process(&self, name: &str) -> Option<&ProcessHandle> {
        self.processes.iter().find(|p| p.name() == name)
    }

    pub(crate) fn process_by_pid(&self, pid: i32) -> Option<&ProcessHandle> {
        self.processes.iter().find(|p| p.pid() == pid)
    }

    pub fn restart_args(&self) -> &[OsString] {
        &self.restart_args
    }

    pub fn handover(&self) -> bool {
        self.handover
    }

    pub(crate) fn add_detached(&self, pid: i32) {
        lock(&self.detached).push(pid);
    }

    pub(crate) fn take_detached(&self, pid: i32) -> bool {
        let mut detached = lock(&self.detached);
        match detached.iter().position(|&p| p == pid) {
            Some(i) => {
                detached.swap_remove(i);
                true
            }
            None => false,
        }
    }

    /// Bind the control-plane socket.
    pub fn bind_listener(&self) -> Result<UnixEndpoint> {
        UnixEndpoint::bind(self.main.socket_path(), self.gid)
    }

    /// Serve the control plane on its own thread.
    pub fn start_listener(self: &Arc<Self>, endpoint: UnixEndpoint) -> Result<()> {
        let sup = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("listener".to_string())
            .spawn(move || listener::serve(&sup, endpoint))?;
        *lock(&self.listener_thread) = Some(handle);
        Ok(())
    }

    /// Start every role. The first failure aborts startup.
    pub fn launch_all(&self) -> Result<()> {
        for pi in &self.processes {
            pi.launch()?;
        }
        Ok(())
    }

    /// Start the watchdog thread.
    pub fn start_watchdog(self: &Arc<Self>) -> Result<()> {
        let sup = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || watchdog::run(&sup))?;
        *lock(&self.watchdog_thread) = Some(handle);
        Ok(())
    }

    /// Listener, roles, then watchdog.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let endpoint = self.bind_listener()?;
        self.start_listener(endpoint)?;
        self.launch_all()?;
        self.start_watchdog()
    }

    /// Relaunch `pi` unless teardown has begun. Returns whether it ran.
    pub(crate) fn relaunch(&self, pi: &ProcessHandle) -> Result<bool> {
        let cancelled = lock(&self.watchdog_cancelled);
        if *cancelled {
            return Ok(false);
        }
        pi.launch()?;
        Ok(true)
    }

    pub fn watchdog_cancelled(&self) -> bool {
        *lock(&self.watchdog_cancelled)
    }

    fn cancel_watchdog(&self) {
        *lock(&self.watchdog_cancelled) = true;
    }

    pub(crate) fn listener_stopping(&self) -> bool {
        self.listener_stop.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ShutdownState {
        *lock(&self.state)
    }

    /// Ask for shutdown. Only the first request is recorded.
    pub fn request_shutdown(&self, reason: ShutdownReason) {
        let mut state = lock(&self.state);
        if *state == ShutdownState::Running {
            tracing::warn!(name = %self.name, %reason, "Shutdown requested");
            *state = ShutdownState::Requested(reason);
            self.state_changed.notify_all();
        }
    }

    /// Block until shutdown has been requested and return why.
    pub fn wait_for_shutdown(&self) -> ShutdownReason {
        let mut state = lock(&self.state);
        loop {
            match *state {
                ShutdownState::Running => {
                    state = self
                        .state_changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                ShutdownState::Requested(reason) => return reason,
                ShutdownState::TearingDown | ShutdownState::Stopped => {
                    return ShutdownReason::ControlCommand;
                }
            }
        }
    }

    /// As [`wait_for_shutdown`](Self::wait_for_shutdown), giving up after `timeout`.
    pub fn wait_for_shutdown_timeout(&self, timeout: Duration) -> Option<ShutdownReason> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if let ShutdownState::Requested(reason) = *state {
                return Some(reason);
            }
            if *state != ShutdownState::Running {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .state_changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Send `msg` to every role. Failures are logged, not escalated.
    pub fn broadcast(&self, msg: &str) {
        for pi in &self.processes {
            if let Err(e) = unix::send_proc(pi, msg) {
                tracing::warn!(process = pi.name(), msg, error = %e, "Failed to broadcast");
            }
        }
    }

    fn signal_children(&self, sig: Signal) {
        for pi in &self.processes {
            if pi.pid() > 0
                && let Err(e) = pi.signal(sig)
            {
                tracing::debug!(process = pi.name(), signal = ?sig, error = %e, "Failed to signal child");
            }
        }
    }

    fn reap_children(&self) {
        let deadline = Instant::now() + Duration::from_millis(200);
        for pi in &self.processes {
            let pid = pi.pid();
            if pid < 1 {
                continue;
            }
            loop {
                match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) if Instant::now() < deadline => {
                        thread::sleep(Duration::from_millis(10));
                    }
                    _ => break,
                }
            }
        }
    }

    fn stop_listener(&self) {
        self.listener_stop.store(true, Ordering::SeqCst);
        let handle = lock(&self.listener_thread).take();
        if let Some(handle) = handle {
            if !handle.is_finished() {
                // Wake the blocking accept.
                let _ = UnixStream::connect(self.main.socket_path());
            }
            if handle.join().is_err() {
                tracing::error!("Listener thread panicked");
            }
        }
    }

    fn join_watchdog(&self) {
        let handle = lock(&self.watchdog_thread).take();
        let Some(handle) = handle else {
            return;
        };
        let start = Instant::now();
        while !handle.is_finished() {
            if start.elapsed() >= WATCHDOG_JOIN_TIMEOUT {
                tracing::warn!("Watchdog still blocked, leaving it behind");
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
        let _ = handle.join();
    }

    /// Stop everything: watchdog, children, listener, pid file.
    pub fn teardown(&self) {
        {
            let mut state = lock(&self.state);
            if matches!(*state, ShutdownState::TearingDown | ShutdownState::Stopped) {
                return;
            }
            if *state == ShutdownState::Running {
                *state = ShutdownState::Requested(ShutdownReason::ControlCommand);
            }
            *state = ShutdownState::TearingDown;
            self.state_changed.notify_all();
        }
        tracing::info!(name = %self.name, "Shutting down children");

        self.cancel_watchdog();
        self.signal_children(Signal::SIGUSR1);
        thread::sleep(self.grace);
        self.signal_children(Signal::SIGKILL);
        self.reap_children();
        self.stop_listener();
        self.join_watchdog();
        pidfile::remove_pid(self.main.pid_path());

        *lock(&self.state) = ShutdownState::Stopped;
        self.state_changed.notify_all();
        tracing::info!(name = %self.name, "Shutdown complete");
    }

    /// Wait for a shutdown request, then tear down.
    pub fn run(&self) -> ShutdownReason {
        let reason = self.wait_for_shutdown();
        self.teardown();
        reason
    }
}

impl LocalShutdown for Supervisor {
    fn request_local_shutdown(&self, reason: ShutdownReason) {
        self.request_shutdown(reason);
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("name", &self.name)
            .field("socket_dir", &self.socket_dir)
            .field("processes", &self.processes)
            .field("state", &self.state())
            .finish()
    }
}

/// Whether the instance rooted at `socket_dir` answers on its listener.
pub fn ping_main<P: AsRef<Path>>(socket_dir: P) -> bool {
    unix::ping(&ProcessHandle::main(socket_dir))
}

/// Send one control message to a running instance.
///
/// Returns the reply, or `None` for `restart`, which the listener never
/// answers. `getfd` hands over a descriptor rather than text and is refused.
pub fn control(socket_dir: &Path, msg: &str) -> Result<Option<String>> {
    let main = ProcessHandle::main(socket_dir);
    if main.resolve_pid() == 0 {
        return Err(PoolError::DeadPeer {
            role: main.name().to_string(),
            pid: 0,
        });
    }
    match listener::Command::parse(msg) {
        listener::Command::GetFd => Err(PoolError::Unsupported(msg.to_string())),
        listener::Command::Restart => {
            unix::send_proc(&main, msg)?;
            Ok(None)
        }
        _ => unix::send_recv_proc(&main, msg).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    fn bare(dir: &Path) -> Arc<Supervisor> {
        Supervisor::new(SupervisorOptions::new("ckpool", dir).with_grace(Duration::from_millis(10)))
    }

    #[test]
    fn test_reason_display() {
        let shown: Vec<String> = [
            ShutdownReason::ControlCommand,
            ShutdownReason::Watchdog,
            ShutdownReason::Signal(15),
            ShutdownReason::SendFailure,
            ShutdownReason::ListenerFailure,
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert_eq!(
            shown,
            [
                "shutdown command",
                "watchdog",
                "signal 15",
                "failed control message",
                "listener failure"
            ]
        );
    }

    #[test]
    fn test_first_request_wins() {
        let tmp = tempdir().unwrap();
        let sup = bare(tmp.path());
        assert_eq!(sup.state(), ShutdownState::Running);

        sup.request_shutdown(ShutdownReason::Signal(15));
        sup.request_shutdown(ShutdownReason::ControlCommand);
        assert_eq!(
            sup.state(),
            ShutdownState::Requested(ShutdownReason::Signal(15))
        );
        assert_eq!(sup.wait_for_shutdown(), ShutdownReason::Signal(15));
    }

    #[test]
    fn test_wait_wakes_on_request_from_other_thread() {
        let tmp = tempdir().unwrap();
        let sup = bare(tmp.path());
        let requester = Arc::clone(&sup);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            requester.request_local_shutdown(ShutdownReason::SendFailure);
        });
        assert_eq!(sup.wait_for_shutdown(), ShutdownReason::SendFailure);
        t.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_while_running() {
        let tmp = tempdir().unwrap();
        let sup = bare(tmp.path());
        assert_eq!(sup.wait_for_shutdown_timeout(Duration::from_millis(20)), None);
    }

    #[test]
    fn test_teardown_stops_listener_and_removes_pid() {
        let tmp = tempdir().unwrap();
        let sup = bare(tmp.path());
        pidfile::write_pid(sup.main().pid_path(), std::process::id() as i32, false).unwrap();
        let endpoint = sup.bind_listener().unwrap();
        sup.start_listener(endpoint).unwrap();
        assert!(ping_main(tmp.path()));

        sup.request_shutdown(ShutdownReason::Signal(2));
        assert_eq!(sup.run(), ShutdownReason::Signal(2));

        assert_eq!(sup.state(), ShutdownState::Stopped);
        assert!(sup.watchdog_cancelled());
        assert!(!sup.main().pid_path().exists());
        assert!(!sup.main().socket_path().exists());
        assert!(!ping_main(tmp.path()));
    }

    #[test]
    fn test_cancelled_watchdog_refuses_relaunch() {
        let tmp = tempdir().unwrap();
        let sup = Supervisor::new(
            SupervisorOptions::new("ckpool", tmp.path())
                .with_role("stratifier", LaunchSpec::new("/bin/true")),
        );
        sup.cancel_watchdog();
        let pi = sup.process("stratifier").unwrap();
        assert!(!sup.relaunch(pi).unwrap());
        assert_eq!(pi.launch_count(), 0);
    }

    #[test]
    fn test_detached_pids_are_tracked_once() {
        let tmp = tempdir().unwrap();
        let sup = bare(tmp.path());
        sup.add_detached(777);
        assert!(sup.take_detached(777));
        assert!(!sup.take_detached(777));
    }

    fn serving(sup: &Arc<Supervisor>) {
        pidfile::write_pid(sup.main().pid_path(), std::process::id() as i32, false).unwrap();
        let endpoint = sup.bind_listener().unwrap();
        sup.start_listener(endpoint).unwrap();
    }

    #[test]
    fn test_control_returns_reply() {
        let tmp = tempdir().unwrap();
        let sup = bare(tmp.path());
        serving(&sup);
        assert_eq!(control(tmp.path(), "ping").unwrap().as_deref(), Some("pong"));
        assert_eq!(control(tmp.path(), "stats").unwrap().as_deref(), Some("unknown"));
        sup.teardown();
    }

    #[test]
    #[serial(process)]
    fn test_control_restart_expects_no_reply() {
        let tmp = tempdir().unwrap();
        let sup = Supervisor::new(
            SupervisorOptions::new("ckpool", tmp.path())
                .with_restart_args(vec![OsString::from("/bin/true")], true)
                .with_grace(Duration::from_millis(10)),
        );
        serving(&sup);

        let start = Instant::now();
        assert_eq!(control(tmp.path(), "restart").unwrap(), None);
        assert!(start.elapsed() < unix::REPLY_TIMEOUT);

        let deadline = Instant::now() + Duration::from_secs(2);
        let pid = loop {
            if let Some(&pid) = lock(&sup.detached).first() {
                break pid;
            }
            assert!(Instant::now() < deadline, "restart never spawned");
            thread::sleep(Duration::from_millis(10));
        };
        waitpid(Pid::from_raw(pid), None).unwrap();
        assert!(ping_main(tmp.path()));
        sup.teardown();
    }

    #[test]
    fn test_control_refuses_getfd() {
        let tmp = tempdir().unwrap();
        let sup = bare(tmp.path());
        serving(&sup);
        assert!(matches!(
            control(tmp.path(), "getfd"),
            Err(PoolError::Unsupported(msg)) if msg == "getfd"
        ));
        assert!(ping_main(tmp.path()));
        sup.teardown();
    }

    #[test]
    fn test_control_without_instance_is_dead_peer() {
        let tmp = tempdir().unwrap();
        assert!(matches!(
            control(tmp.path(), "ping"),
            Err(PoolError::DeadPeer { .. })
        ));
    }
}
