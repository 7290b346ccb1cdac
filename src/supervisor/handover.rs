//! Live restart and listening-socket handover.
//!
//! `restart` on the control plane spawns a fresh copy of this instance with
//! `-H`. That copy asks the running instance for the connector's listening
//! descriptor, tells it to shut down, and hands the inherited descriptor to
//! its own connector, so the public port never stops accepting.

use std::ffi::OsString;
use std::os::unix::io::OwnedFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use super::Supervisor;
use crate::error::{PoolError, Result};
use crate::ipc::fd::recv_fd;
use crate::ipc::unix::{REPLY_TIMEOUT, open_unix_client, send_unix_msg};
use crate::paths;
use crate::pidfile;

/// Flag that marks a handover start.
pub const HANDOVER_FLAG: &str = "-H";

/// How long a new instance waits for its predecessor to exit.
pub const PREDECESSOR_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// argv for the replacement instance.
pub fn restart_argv(initial: &[OsString], handover: bool) -> Vec<OsString> {
    let mut argv = initial.to_vec();
    if !handover {
        argv.push(OsString::from(HANDOVER_FLAG));
    }
    argv
}

/// Spawn the replacement instance detached from this one.
pub fn spawn_restart(sup: &Supervisor) -> Result<i32> {
    let argv = restart_argv(sup.restart_args(), sup.handover());
    let Some((program, args)) = argv.split_first() else {
        return Err(PoolError::Spawn {
            role: sup.name().to_string(),
            reason: "no recorded command line".into(),
        });
    };

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .process_group(0)
        .spawn()
        .map_err(|e| PoolError::Spawn {
            role: sup.name().to_string(),
            reason: e.to_string(),
        })?;
    let pid = child.id() as i32;
    sup.add_detached(pid);
    Ok(pid)
}

/// Take over from the instance listening under `socket_dir`.
///
/// Returns the inherited listening descriptor, or `None` when there was no
/// predecessor or it had nothing to hand over. Either way the predecessor
/// has been told to shut down.
pub fn take_over(socket_dir: &Path) -> Option<OwnedFd> {
    let listener = paths::listener_path(socket_dir);
    let oldpid = pidfile::read_pid(paths::pid_path(socket_dir, paths::MAIN_PROCNAME));

    let mut stream = match open_unix_client(&listener) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::info!(path = %listener.display(), error = %e, "No instance to hand over from");
            return None;
        }
    };
    if let Err(e) = send_unix_msg(&mut stream, "getfd") {
        tracing::warn!(error = %e, "Failed to request descriptor for handover");
        return None;
    }
    let fd = match recv_fd(&stream, Some(REPLY_TIMEOUT)) {
        Ok(fd) => {
            tracing::warn!("Inherited old listening socket");
            Some(fd)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to inherit listening socket");
            None
        }
    };
    drop(stream);

    match open_unix_client(&listener) {
        Ok(mut stream) => {
            if let Err(e) = send_unix_msg(&mut stream, "shutdown") {
                tracing::warn!(error = %e, "Failed to send shutdown to old instance");
            }
        }
        Err(e) => tracing::warn!(error = %e, "Failed to reconnect to old instance"),
    }

    if oldpid > 0 && !pidfile::wait_for_exit(oldpid, PREDECESSOR_EXIT_TIMEOUT) {
        tracing::warn!(pid = oldpid, "Old instance still running after handover");
    }
    fd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::fd::send_fd;
    use crate::ipc::unix::{UnixEndpoint, recv_unix_msg};
    use std::net::TcpListener;
    use std::os::unix::io::AsFd;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn test_restart_argv_appends_flag_once() {
        let initial = vec![OsString::from("ckpool"), OsString::from("-k")];
        assert_eq!(
            restart_argv(&initial, false),
            vec![
                OsString::from("ckpool"),
                OsString::from("-k"),
                OsString::from("-H")
            ]
        );
        assert_eq!(restart_argv(&initial, true), initial);
    }

    #[test]
    #[serial_test::serial(process)]
    fn test_spawn_restart_tracks_detached_child() {
        use crate::supervisor::SupervisorOptions;
        use nix::sys::wait::{WaitStatus, waitpid};
        use nix::unistd::Pid;

        let tmp = tempdir().unwrap();
        let sup = Supervisor::new(
            SupervisorOptions::new("ckpool", tmp.path())
                .with_restart_args(vec![OsString::from("/bin/true")], false),
        );
        let pid = spawn_restart(&sup).unwrap();
        assert!(pid > 0);
        assert!(sup.take_detached(pid));
        assert!(!sup.take_detached(pid));
        assert!(matches!(
            waitpid(Pid::from_raw(pid), None).unwrap(),
            WaitStatus::Exited(_, 0)
        ));
    }

    #[test]
    fn test_spawn_restart_without_argv_fails() {
        let tmp = tempdir().unwrap();
        let sup = Supervisor::new(crate::supervisor::SupervisorOptions::new("ckpool", tmp.path()));
        assert!(matches!(spawn_restart(&sup), Err(PoolError::Spawn { .. })));
    }

    #[test]
    fn test_take_over_without_predecessor() {
        let tmp = tempdir().unwrap();
        assert!(take_over(tmp.path()).is_none());
    }

    #[test]
    fn test_take_over_receives_descriptor_then_sends_shutdown() {
        let tmp = tempdir().unwrap();
        let endpoint = UnixEndpoint::bind(paths::listener_path(tmp.path()), None).unwrap();
        let public = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = public.local_addr().unwrap();

        let old = thread::spawn(move || {
            let mut seen = Vec::new();
            let stream = endpoint.accept().unwrap();
            let msg = recv_unix_msg(&stream, Some(Duration::from_secs(2))).unwrap();
            send_fd(&stream, public.as_fd()).unwrap();
            seen.push(msg);
            let stream = endpoint.accept().unwrap();
            seen.push(recv_unix_msg(&stream, Some(Duration::from_secs(2))).unwrap());
            seen
        });

        let fd = take_over(tmp.path()).unwrap();
        assert_eq!(TcpListener::from(fd).local_addr().unwrap(), addr);
        assert_eq!(old.join().unwrap(), vec!["getfd", "shutdown"]);
    }
}
