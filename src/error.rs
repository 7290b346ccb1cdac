//! Error types for the ckpool control plane.

use std::path::PathBuf;

use thiserror::Error;

use crate::ipc::conn::ChannelError;

/// Main error type for ckpool.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Attempted to send message '{0}' to an empty socket path")]
    EmptyPath(String),

    #[error("Attempted to send an empty message to socket {}", .0.display())]
    EmptyMessage(PathBuf),

    #[error("Process {role} (pid {pid}) is not alive")]
    DeadPeer { role: String, pid: i32 },

    #[error("Failed to send '{msg}' to socket {}", path.display())]
    Send { msg: String, path: PathBuf },

    #[error("No reply from socket {}", .0.display())]
    NoReply(PathBuf),

    #[error("Process {name} pid {pid} still exists, start with --killold to kill it")]
    AlreadyRunning { name: String, pid: i32 },

    #[error("Failed to launch {role}: {reason}")]
    Spawn { role: String, reason: String },

    #[error("Descriptor transfer failed: {0}")]
    FdTransfer(String),

    #[error("'{0}' cannot be sent from the command line")]
    Unsupported(String),

    #[error("Unknown group '{0}'")]
    UnknownGroup(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for ckpool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_dead_peer_message() {
        let err = PoolError::DeadPeer {
            role: "stratifier".to_string(),
            pid: 4242,
        };
        let msg = err.to_string();
        assert!(msg.contains("stratifier"));
        assert!(msg.contains("4242"));
    }

    #[test]
    fn test_already_running_mentions_killold() {
        let err = PoolError::AlreadyRunning {
            name: "/tmp/ckpool/main.pid".to_string(),
            pid: 17,
        };
        assert!(err.to_string().contains("--killold"));
    }

    #[test]
    fn test_empty_message_shows_path() {
        let err = PoolError::EmptyMessage(PathBuf::from("/tmp/ckpool/connector"));
        assert!(err.to_string().contains("/tmp/ckpool/connector"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "socket missing");
        let err: PoolError = io_err.into();
        assert!(err.to_string().contains("socket missing"));
    }

    #[test]
    fn test_errno_conversion() {
        let err: PoolError = nix::errno::Errno::ESRCH.into();
        assert!(matches!(err, PoolError::Sys(nix::errno::Errno::ESRCH)));
    }

    #[test]
    fn test_channel_error_conversion() {
        let err: PoolError = ChannelError::Timeout.into();
        assert!(err.to_string().contains("timed out"));
    }
}
