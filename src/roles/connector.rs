//! Connector role: owner of the pool's public listening socket.
//!
//! The socket is bound on `serverurl`, or inherited from a previous instance
//! during a handover. `getfd` passes it out-of-band to whoever asks.

use std::net::TcpListener;
use std::os::unix::io::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;

use super::RoleContext;
use super::runtime::{self, RoleService};
use crate::error::{PoolError, Result};
use crate::ipc::fd::send_fd;

#[derive(Debug)]
pub struct Connector {
    listener: TcpListener,
}

impl Connector {
    /// Bind `serverurl`.
    pub fn bind(serverurl: &str) -> Result<Self> {
        let listener = TcpListener::bind(serverurl).map_err(|e| {
            tracing::error!(serverurl, error = %e, "Failed to bind server socket");
            PoolError::Config(format!("cannot bind {serverurl}: {e}"))
        })?;
        Ok(Self { listener })
    }

    /// Use a listening socket inherited from a previous instance.
    pub fn inherit(fd: OwnedFd) -> Self {
        Self {
            listener: TcpListener::from(fd),
        }
    }

    pub fn listener(&self) -> &TcpListener {
        &self.listener
    }
}

impl RoleService for Connector {
    fn name(&self) -> &'static str {
        "connector"
    }

    fn handle(&mut self, msg: &str, stream: &mut UnixStream) -> bool {
        if !msg.starts_with("getfd") {
            return false;
        }
        tracing::debug!("Sending listening socket on request");
        if let Err(e) = send_fd(stream, self.listener.as_fd()) {
            tracing::warn!(error = %e, "Failed to send listening socket");
        }
        true
    }
}

pub fn run(ctx: RoleContext) -> Result<i32> {
    let mut connector = match ctx.listen_fd {
        Some(fd) => {
            let connector = Connector::inherit(fd);
            tracing::warn!(addr = ?connector.listener.local_addr().ok(), "Connector using inherited socket");
            connector
        }
        None => Connector::bind(&ctx.config.serverurl)?,
    };
    tracing::info!(addr = ?connector.listener.local_addr().ok(), "Connector listening");
    runtime::run(&mut connector, &ctx.socket_dir, ctx.killold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::fd::recv_fd;
    use std::time::Duration;

    #[test]
    fn test_getfd_passes_listening_socket() {
        let mut connector = Connector::bind("127.0.0.1:0").unwrap();
        let addr = connector.listener().local_addr().unwrap();
        let (mut server, client) = UnixStream::pair().unwrap();

        assert!(connector.handle("getfd", &mut server));
        let fd = recv_fd(&client, Some(Duration::from_secs(2))).unwrap();
        let received = TcpListener::from(fd);
        assert_eq!(received.local_addr().unwrap(), addr);
    }

    #[test]
    fn test_inherited_socket_keeps_address() {
        let original = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = original.local_addr().unwrap();
        let connector = Connector::inherit(OwnedFd::from(original));
        assert_eq!(connector.listener().local_addr().unwrap(), addr);
    }

    #[test]
    fn test_bind_failure_is_error() {
        assert!(Connector::bind("not an address").is_err());
    }
}
