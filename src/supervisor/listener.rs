//! Control-plane listener.
//!
//! Serves `<sockdir>/listener` on one thread, one connection at a time. Every
//! command gets at most one reply frame before the connection is closed.
//!
//! | command        | reply                              |
//! |----------------|------------------------------------|
//! | `shutdown`     | `exiting`, then the loop ends      |
//! | `ping`         | `pong`                             |
//! | `loglevel=N`   | `success`, `Invalid` or `Failed`   |
//! | `getfd`        | connector's listening descriptor   |
//! | `restart`      | none                               |
//! | anything else  | `unknown`                          |

use std::io;
use std::os::unix::io::AsFd;
use std::os::unix::net::UnixStream;

use super::{ShutdownReason, Supervisor, handover};
use crate::ipc::fd::{recv_fd, send_fd};
use crate::ipc::unix::{self, REPLY_TIMEOUT, UnixEndpoint, recv_unix_msg, send_unix_msg};
use crate::logging::{self, SeverityError};

/// Role that owns the externally visible listening socket.
pub const CONNECTOR: &str = "connector";

/// A parsed control-plane command. Matching is by case-sensitive prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    Shutdown,
    Ping,
    /// Everything after the `loglevel` prefix.
    LogLevel(&'a str),
    GetFd,
    Restart,
    Unknown(&'a str),
}

impl<'a> Command<'a> {
    pub fn parse(msg: &'a str) -> Self {
        if msg.starts_with("shutdown") {
            Self::Shutdown
        } else if msg.starts_with("ping") {
            Self::Ping
        } else if let Some(rest) = msg.strip_prefix("loglevel") {
            Self::LogLevel(rest)
        } else if msg.starts_with("getfd") {
            Self::GetFd
        } else if msg.starts_with("restart") {
            Self::Restart
        } else {
            Self::Unknown(msg)
        }
    }
}

/// Whether the accept loop keeps going after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Accept loop. Returns when told to shut down or when accept fails; a
/// failed accept outside teardown stops the pool.
pub(crate) fn serve(sup: &Supervisor, endpoint: UnixEndpoint) {
    tracing::debug!(path = %endpoint.path().display(), "Listener started");
    loop {
        let mut stream = match endpoint.accept() {
            Ok(stream) => stream,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!(error = %e, "Failed to accept on socket in listener");
                if !sup.listener_stopping() {
                    sup.request_shutdown(ShutdownReason::ListenerFailure);
                }
                break;
            }
        };
        if sup.listener_stopping() {
            break;
        }
        if handle_connection(sup, &mut stream) == Flow::Exit {
            break;
        }
    }
    tracing::debug!("Listener exiting");
}

fn reply(stream: &mut UnixStream, msg: &str) {
    if let Err(e) = send_unix_msg(stream, msg) {
        tracing::debug!(reply = msg, error = %e, "Failed to send listener reply");
    }
}

/// Read one command from `stream` and act on it.
pub fn handle_connection(sup: &Supervisor, stream: &mut UnixStream) -> Flow {
    let msg = match recv_unix_msg(stream, Some(REPLY_TIMEOUT)) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to get message in listener");
            reply(stream, "failed");
            return Flow::Continue;
        }
    };
    dispatch(sup, &msg, stream)
}

/// Execute one command, replying on `stream`.
pub fn dispatch(sup: &Supervisor, msg: &str, stream: &mut UnixStream) -> Flow {
    match Command::parse(msg) {
        Command::Shutdown => {
            tracing::warn!(name = sup.name(), "Listener received shutdown message, terminating");
            reply(stream, "exiting");
            sup.request_shutdown(ShutdownReason::ControlCommand);
            return Flow::Exit;
        }
        Command::Ping => {
            tracing::debug!("Listener received ping request");
            reply(stream, "pong");
        }
        Command::LogLevel(rest) => reply(stream, apply_loglevel(sup, rest)),
        Command::GetFd => forward_listen_fd(sup, stream),
        Command::Restart => match handover::spawn_restart(sup) {
            Ok(pid) => tracing::warn!(pid, "Spawned restart process for handover"),
            Err(e) => tracing::error!(error = %e, "Failed to spawn restart process"),
        },
        Command::Unknown(other) => {
            tracing::info!(msg = other, "Listener received unhandled message");
            reply(stream, "unknown");
        }
    }
    Flow::Continue
}

fn apply_loglevel(sup: &Supervisor, rest: &str) -> &'static str {
    let Some(value) = rest.strip_prefix('=') else {
        tracing::warn!(msg = rest, "Failed to parse loglevel message");
        return "Failed";
    };
    match logging::parse_severity(value) {
        Ok(severity) => {
            if logging::set_severity(severity).is_err() {
                return "Invalid";
            }
            sup.broadcast(&format!("loglevel={severity}"));
            "success"
        }
        Err(SeverityError::OutOfRange(n)) => {
            tracing::warn!(loglevel = n, "Invalid loglevel sent");
            "Invalid"
        }
        Err(SeverityError::Unparsable(s)) => {
            tracing::warn!(msg = %s, "Failed to parse loglevel message");
            "Failed"
        }
    }
}

/// Fetch the connector's listening descriptor and pass it to the requester.
/// Any failure leaves the requester with nothing.
fn forward_listen_fd(sup: &Supervisor, requester: &UnixStream) {
    let Some(connector) = sup.process(CONNECTOR) else {
        tracing::warn!("No connector process to get descriptor from");
        return;
    };
    let conn = match unix::send_procmsg(connector, "getfd") {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to send_procmsg to connector");
            return;
        }
    };
    let fd = match recv_fd(&conn, Some(REPLY_TIMEOUT)) {
        Ok(fd) => fd,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to get_fd");
            return;
        }
    };
    tracing::debug!("Sending listening descriptor to requester");
    if let Err(e) = send_fd(requester, fd.as_fd()) {
        tracing::warn!(error = %e, "Failed to send descriptor");
    }
}
