//! ckpool - process supervisor and IPC control plane for a mining pool.
//!
//! A parent process launches the generator, stratifier and connector roles,
//! watches them, and serves a unix-socket control plane. Roles talk to each
//! other and to the parent with short newline-framed messages.

pub mod cli;
pub mod config;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod msgq;
pub mod paths;
pub mod pidfile;
pub mod roles;
pub mod rpc;
pub mod supervisor;

pub use error::{PoolError, Result};
