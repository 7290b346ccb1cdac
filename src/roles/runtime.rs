//! Socket server loop shared by every role.
//!
//! Messages are handled serially, one connection each:
//! `ping` gets `pong`, `loglevel=N` changes the local severity without a
//! reply, `shutdown` ends the loop, and anything else goes to the role's
//! [`RoleService`] or is answered with `unknown`.

use std::io;
use std::os::unix::net::UnixStream;

use super::RoleShutdown;
use crate::error::Result;
use crate::ipc::unix::{REPLY_TIMEOUT, UnixEndpoint, recv_unix_msg, send_unix_msg};
use crate::supervisor::signals::install_child_handlers;
use crate::{logging, paths, pidfile};

/// Role-specific commands.
pub trait RoleService {
    /// Role name, which is also its socket and pid file name.
    fn name(&self) -> &'static str;

    /// Handle `msg`, replying on `stream` if the command has a reply.
    /// Returns `false` when the command is not recognised.
    fn handle(&mut self, msg: &str, stream: &mut UnixStream) -> bool;
}

/// Send one reply frame, logging failures.
pub fn reply(stream: &mut UnixStream, msg: &str) {
    if let Err(e) = send_unix_msg(stream, msg) {
        tracing::debug!(reply = msg, error = %e, "Failed to send reply");
    }
}

/// Whether the loop should keep serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    Continue,
    Shutdown,
}

/// Act on one message received by a role.
pub fn handle_message<S: RoleService + ?Sized>(
    service: &mut S,
    msg: &str,
    stream: &mut UnixStream,
) -> Served {
    if msg.starts_with("shutdown") {
        tracing::info!(role = service.name(), "Received shutdown message");
        return Served::Shutdown;
    }
    if msg.starts_with("ping") {
        reply(stream, "pong");
    } else if let Some(value) = msg.strip_prefix("loglevel=") {
        match logging::parse_severity(value) {
            Ok(severity) => {
                if let Err(e) = logging::set_severity(severity) {
                    tracing::warn!(error = %e, "Failed to apply loglevel");
                }
            }
            Err(e) => tracing::warn!(role = service.name(), error = %e, "Invalid loglevel message"),
        }
    } else if !service.handle(msg, stream) {
        tracing::info!(role = service.name(), msg, "Unhandled message");
        reply(stream, "unknown");
    }
    Served::Continue
}

/// Serve on an already bound endpoint until told to shut down.
pub fn serve_endpoint<S: RoleService + ?Sized>(service: &mut S, endpoint: &UnixEndpoint) -> Result<i32> {
    loop {
        let mut stream = match endpoint.accept() {
            Ok(stream) => stream,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!(role = service.name(), error = %e, "Failed to accept on socket");
                return Err(e.into());
            }
        };
        let msg = match recv_unix_msg(&stream, Some(REPLY_TIMEOUT)) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(role = service.name(), error = %e, "Failed to read message");
                continue;
            }
        };
        tracing::debug!(role = service.name(), msg = %msg, "Received message");
        if handle_message(service, &msg, &mut stream) == Served::Shutdown {
            return Ok(0);
        }
    }
}

/// Full lifecycle of a role process: pid file, signals, socket, serve loop.
pub fn run<S: RoleService + ?Sized>(
    service: &mut S,
    socket_dir: &std::path::Path,
    killold: bool,
) -> Result<i32> {
    let name = service.name();
    let pid_path = paths::pid_path(socket_dir, name);
    pidfile::write_pid(&pid_path, std::process::id() as i32, killold)?;

    let files = RoleShutdown::new(socket_dir, name);
    let cleanup = files.clone();
    install_child_handlers(move || cleanup.cleanup())?;

    let endpoint = UnixEndpoint::bind(paths::socket_path(socket_dir, name), None)?;
    let ret = serve_endpoint(service, &endpoint);
    drop(endpoint);
    files.cleanup();
    ret
}
