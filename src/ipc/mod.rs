//! Inter-process messaging.
//!
//! - [`conn`]: newline-framed reads over a raw stream socket
//! - [`unix`]: short-lived request/response calls between processes
//! - [`fd`]: passing open descriptors across a unix socket

pub mod conn;
pub mod fd;
pub mod unix;

pub use conn::{ChannelError, ConnSock, LineBuffer};
pub use unix::{UnixEndpoint, send_proc, send_proc_or_stop, send_recv_proc};
