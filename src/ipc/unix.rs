//! Unix-domain request/response transport.
//!
//! Every cross-process call opens a short-lived client connection to the
//! peer's socket, writes one newline-terminated frame and, for requests,
//! reads exactly one frame back before closing.

use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::OwnedFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::unistd::Gid;

use super::conn::{ChannelError, ConnSock};
use crate::error::{PoolError, Result};
use crate::supervisor::process::ProcessHandle;
use crate::supervisor::{LocalShutdown, ShutdownReason};

/// How long a caller waits for a reply frame.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// A bound listening socket that is unlinked when dropped.
#[derive(Debug)]
pub struct UnixEndpoint {
    path: PathBuf,
    listener: UnixListener,
}

impl UnixEndpoint {
    /// Bind `path`, replacing any stale socket file, and hand it to `gid`.
    pub fn bind<P: AsRef<Path>>(path: P, gid: Option<Gid>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        tracing::debug!(path = %path.display(), "Opening unix socket");
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o770))?;
        if let Some(gid) = gid {
            nix::unistd::chown(&path, None, Some(gid))?;
        }
        Ok(Self { path, listener })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn listener(&self) -> &UnixListener {
        &self.listener
    }

    pub fn accept(&self) -> io::Result<UnixStream> {
        self.listener.accept().map(|(stream, _)| stream)
    }
}

impl Drop for UnixEndpoint {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Connect to the socket at `path`.
pub fn open_unix_client<P: AsRef<Path>>(path: P) -> io::Result<UnixStream> {
    let stream = UnixStream::connect(path)?;
    stream.set_write_timeout(Some(REPLY_TIMEOUT))?;
    Ok(stream)
}

/// Write one frame.
pub fn send_unix_msg(stream: &mut UnixStream, msg: &str) -> io::Result<()> {
    let mut frame = Vec::with_capacity(msg.len() + 1);
    frame.extend_from_slice(msg.as_bytes());
    frame.push(b'\n');
    stream.write_all(&frame)?;
    stream.flush()
}

/// Read one frame, leaving `stream` open for a reply.
pub fn recv_unix_msg(stream: &UnixStream, timeout: Option<Duration>) -> Result<String> {
    let mut conn = ConnSock::from_fd(OwnedFd::from(stream.try_clone()?));
    conn.read_line(timeout).map_err(PoolError::from)
}

fn check_target(path: &Path, msg: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        tracing::error!(msg, "Attempted to send message to null path");
        return Err(PoolError::EmptyPath(msg.to_string()));
    }
    if msg.is_empty() {
        tracing::error!(path = %path.display(), "Attempted to send null message");
        return Err(PoolError::EmptyMessage(path.to_path_buf()));
    }
    Ok(())
}

fn check_alive(pi: &ProcessHandle, msg: &str) -> Result<()> {
    if !pi.is_alive() {
        tracing::error!(msg, process = pi.name(), "Attempting to send message to dead process");
        return Err(PoolError::DeadPeer {
            role: pi.name().to_string(),
            pid: pi.pid(),
        });
    }
    Ok(())
}

fn connect_and_send(path: &Path, msg: &str) -> Result<UnixStream> {
    let mut stream = open_unix_client(path).map_err(|e| {
        tracing::warn!(path = %path.display(), error = %e, "Failed to open socket");
        PoolError::Io(e)
    })?;
    send_unix_msg(&mut stream, msg).map_err(|e| {
        tracing::warn!(msg, path = %path.display(), error = %e, "Failed to send to socket");
        PoolError::Send {
            msg: msg.to_string(),
            path: path.to_path_buf(),
        }
    })?;
    Ok(stream)
}

/// One-way message to a managed process; the connection closes immediately.
pub fn send_proc(pi: &ProcessHandle, msg: &str) -> Result<()> {
    check_target(pi.socket_path(), msg)?;
    check_alive(pi, msg)?;
    connect_and_send(pi.socket_path(), msg)?;
    Ok(())
}

/// As [`send_proc`], but a failure stops the local process.
///
/// The sender can no longer trust its view of the system once a control
/// message is lost, so it asks `local` to shut down.
pub fn send_proc_or_stop(pi: &ProcessHandle, msg: &str, local: &dyn LocalShutdown) -> bool {
    match send_proc(pi, msg) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(msg, process = pi.name(), error = %e, "Failure in send_proc, stopping");
            local.request_local_shutdown(ShutdownReason::SendFailure);
            false
        }
    }
}

/// Send a message and keep the connection open for an out-of-band reply.
pub fn send_procmsg(pi: &ProcessHandle, msg: &str) -> Result<UnixStream> {
    check_target(pi.socket_path(), msg)?;
    check_alive(pi, msg)?;
    connect_and_send(pi.socket_path(), msg)
}

/// Send a message to a managed process and return its single reply.
pub fn send_recv_proc(pi: &ProcessHandle, msg: &str) -> Result<String> {
    let stream = send_procmsg(pi, msg)?;
    recv_reply(pi.socket_path(), &stream)
}

/// Request/response to an unmanaged endpoint (the external db logger).
///
/// There is no process to check, so only the path and message are checked.
pub fn send_recv_path<P: AsRef<Path>>(path: P, msg: &str) -> Result<String> {
    let path = path.as_ref();
    check_target(path, msg)?;
    let stream = connect_and_send(path, msg)?;
    recv_reply(path, &stream)
}

/// Send a JSON message to the db logger and return its response.
pub fn ckdb_msg_call<P: AsRef<Path>>(path: P, msg: &str) -> Result<String> {
    tracing::trace!(msg, "Sending ckdb");
    let reply = send_recv_path(path, msg)?;
    tracing::trace!(reply = %reply, "Received from ckdb");
    Ok(reply)
}

fn recv_reply(path: &Path, stream: &UnixStream) -> Result<String> {
    match recv_unix_msg(stream, Some(REPLY_TIMEOUT)) {
        Ok(reply) => Ok(reply),
        Err(PoolError::Channel(e)) => {
            let timed_out = matches!(e, ChannelError::Timeout);
            tracing::error!(path = %path.display(), timed_out, "Failure in send_recv");
            Err(PoolError::NoReply(path.to_path_buf()))
        }
        Err(e) => Err(e),
    }
}

/// Whether the process behind `pi` answers `ping`.
pub fn ping(pi: &ProcessHandle) -> bool {
    send_recv_proc(pi, "ping").is_ok_and(|reply| reply == "pong")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::process::LaunchSpec;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn me(dir: &Path, name: &str) -> ProcessHandle {
        let pi = ProcessHandle::role(dir, name, LaunchSpec::new("/bin/true"));
        pi.set_pid(std::process::id() as i32);
        pi
    }

    fn serve_once(endpoint: UnixEndpoint, reply: Option<&'static str>) -> std::thread::JoinHandle<String> {
        std::thread::spawn(move || {
            let mut stream = endpoint.accept().unwrap();
            let msg = recv_unix_msg(&stream, Some(Duration::from_secs(2))).unwrap();
            if let Some(reply) = reply {
                send_unix_msg(&mut stream, reply).unwrap();
            }
            msg
        })
    }

    #[test]
    fn test_endpoint_unlinks_on_drop() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("generator");
        let endpoint = UnixEndpoint::bind(&path, None).unwrap();
        assert!(path.exists());
        drop(endpoint);
        assert!(!path.exists());
    }

    #[test]
    fn test_endpoint_replaces_stale_socket() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("stratifier");
        let stale = UnixListener::bind(&path).unwrap();
        std::mem::forget(stale);
        assert!(UnixEndpoint::bind(&path, None).is_ok());
    }

    #[test]
    fn test_send_recv_round_trip() {
        let tmp = tempdir().unwrap();
        let pi = me(tmp.path(), "stratifier");
        let endpoint = UnixEndpoint::bind(pi.socket_path(), None).unwrap();
        let server = serve_once(endpoint, Some("pong"));

        assert_eq!(send_recv_proc(&pi, "ping").unwrap(), "pong");
        assert_eq!(server.join().unwrap(), "ping");
    }

    #[test]
    fn test_send_proc_one_way() {
        let tmp = tempdir().unwrap();
        let pi = me(tmp.path(), "generator");
        let endpoint = UnixEndpoint::bind(pi.socket_path(), None).unwrap();
        let server = serve_once(endpoint, None);

        send_proc(&pi, "loglevel=7").unwrap();
        assert_eq!(server.join().unwrap(), "loglevel=7");
    }

    #[test]
    fn test_empty_message_rejected() {
        let tmp = tempdir().unwrap();
        let pi = me(tmp.path(), "generator");
        assert!(matches!(send_proc(&pi, ""), Err(PoolError::EmptyMessage(_))));
    }

    #[test]
    fn test_dead_peer_rejected() {
        let tmp = tempdir().unwrap();
        let pi = ProcessHandle::role(tmp.path(), "connector", LaunchSpec::new("/bin/true"));
        let err = send_recv_proc(&pi, "ping").unwrap_err();
        assert!(matches!(err, PoolError::DeadPeer { .. }));
    }

    #[test]
    fn test_missing_socket_is_error_not_hang() {
        let tmp = tempdir().unwrap();
        let pi = me(tmp.path(), "connector");
        assert!(!ping(&pi));
    }

    #[test]
    fn test_silent_peer_times_out() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("ckdb");
        let endpoint = UnixEndpoint::bind(&path, None).unwrap();
        let server = std::thread::spawn(move || {
            let stream = endpoint.accept().unwrap();
            std::thread::sleep(REPLY_TIMEOUT + Duration::from_millis(500));
            drop(stream);
        });
        let err = send_recv_path(&path, "{\"method\":\"heartbeat\"}").unwrap_err();
        assert!(matches!(err, PoolError::NoReply(_)));
        server.join().unwrap();
    }

    #[test]
    fn test_unmanaged_endpoint_skips_liveness() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("listener");
        let endpoint = UnixEndpoint::bind(&path, None).unwrap();
        let server = serve_once(endpoint, Some("ok.added"));
        assert_eq!(ckdb_msg_call(&path, "adduser").unwrap(), "ok.added");
        server.join().unwrap();
    }

    struct Recorder(Mutex<Vec<ShutdownReason>>);

    impl LocalShutdown for Recorder {
        fn request_local_shutdown(&self, reason: ShutdownReason) {
            self.0.lock().unwrap().push(reason);
        }
    }

    #[test]
    fn test_failed_one_way_send_escalates() {
        let tmp = tempdir().unwrap();
        let pi = ProcessHandle::role(tmp.path(), "stratifier", LaunchSpec::new("/bin/true"));
        let recorder = Recorder(Mutex::new(Vec::new()));
        assert!(!send_proc_or_stop(&pi, "shutdown", &recorder));
        assert_eq!(*recorder.0.lock().unwrap(), vec![ShutdownReason::SendFailure]);
    }
}
