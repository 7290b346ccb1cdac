//! Line-framed socket channel.
//!
//! [`ConnSock`] assembles newline-terminated messages from a raw stream
//! socket. Bytes received past a frame boundary stay in the [`LineBuffer`]
//! and are handed out by the next call before any new read is attempted.

use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::time::Duration;

use thiserror::Error;

/// Scratch size for a single read.
const PAGE_SIZE: usize = 4096;

/// Failure modes of a line read.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("read timed out with no complete line")]
    Timeout,

    #[error("read failed: {0}")]
    Read(#[from] io::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// Growable receive buffer with leftover tracking.
///
/// `data[start..]` holds bytes received but not yet returned as a line.
#[derive(Debug, Default)]
pub struct LineBuffer {
    data: Vec<u8>,
    start: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes, compacting consumed space first.
    pub fn append_bytes(&mut self, bytes: &[u8]) {
        if self.start > 0 {
            self.data.drain(..self.start);
            self.start = 0;
        }
        self.data.extend_from_slice(bytes);
    }

    /// Pop the next complete line, without its `\n` (or `\r\n`).
    pub fn consume_line(&mut self) -> Option<String> {
        let pending = &self.data[self.start..];
        let eol = pending.iter().position(|&b| b == b'\n')?;
        let mut line = &pending[..eol];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        let line = String::from_utf8_lossy(line).into_owned();
        self.start += eol + 1;
        if self.start == self.data.len() {
            self.data.clear();
            self.start = 0;
        }
        Some(line)
    }

    /// Number of unconsumed bytes.
    pub fn leftover_len(&self) -> usize {
        self.data.len() - self.start
    }

    /// Whether a full line is already buffered.
    pub fn has_line(&self) -> bool {
        self.data[self.start..].contains(&b'\n')
    }

    /// Drop all buffered bytes and release the allocation.
    pub fn clear(&mut self) {
        self.data = Vec::new();
        self.start = 0;
    }
}

/// A protocol connection: descriptor, remote endpoint and receive buffer.
///
/// `fd` is `None` once the connection has failed or been closed; the next
/// user must reconnect.
#[derive(Debug, Default)]
pub struct ConnSock {
    fd: Option<OwnedFd>,
    /// Remote host.
    pub url: String,
    /// Remote port.
    pub port: String,
    /// Base64 `user:pass` credential for Basic auth.
    pub auth: String,
    buffer: LineBuffer,
    reads: u64,
}

impl ConnSock {
    /// Wrap an already connected descriptor.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            fd: Some(fd),
            ..Self::default()
        }
    }

    /// Describe a TCP endpoint without connecting yet.
    pub fn with_endpoint(
        url: impl Into<String>,
        port: impl Into<String>,
        auth: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            port: port.into(),
            auth: auth.into(),
            ..Self::default()
        }
    }

    /// Open (or reopen) the TCP connection to `url:port`.
    pub fn connect(&mut self) -> io::Result<()> {
        self.reset();
        let addr = format!("{}:{}", self.url, self.port);
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no address resolved");
        for sa in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&sa, Duration::from_secs(5)) {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    self.fd = Some(OwnedFd::from(stream));
                    return Ok(());
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// Borrow the descriptor while the connection is open.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    pub fn buffer(&self) -> &LineBuffer {
        &self.buffer
    }

    /// Number of socket reads performed so far.
    pub fn read_count(&self) -> u64 {
        self.reads
    }

    /// Free the buffer and close the descriptor.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.fd = None;
    }

    /// Forget buffered bytes but keep the connection.
    pub fn empty_buffer(&mut self) {
        self.buffer.clear();
    }

    /// Read the next newline-delimited line.
    ///
    /// A line already sitting in the leftover bytes is returned without
    /// touching the socket. `None` waits indefinitely for readability.
    /// On any failure the buffer is freed and the descriptor closed.
    pub fn read_line(&mut self, timeout: Option<Duration>) -> Result<String, ChannelError> {
        let result = self.try_read_line(timeout);
        if let Err(e) = &result {
            match e {
                ChannelError::Timeout => tracing::debug!("Select timed out in read_line"),
                ChannelError::Read(err) => tracing::error!(error = %err, "Failed to recv in read_line"),
                ChannelError::ConnectionClosed => {}
            }
            self.reset();
        }
        result
    }

    fn try_read_line(&mut self, timeout: Option<Duration>) -> Result<String, ChannelError> {
        if self.fd.is_none() {
            return Err(ChannelError::ConnectionClosed);
        }
        if let Some(line) = self.buffer.consume_line() {
            return Ok(line);
        }

        let mut scratch = [0u8; PAGE_SIZE];
        loop {
            let fd = self.fd.as_ref().ok_or(ChannelError::ConnectionClosed)?;
            if !wait_readable(fd.as_fd(), timeout)? {
                return Err(ChannelError::Timeout);
            }
            let n = read_retry(fd, &mut scratch)?;
            self.reads += 1;
            if n == 0 {
                return Err(ChannelError::Read(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed connection",
                )));
            }
            self.buffer.append_bytes(&scratch[..n]);
            if let Some(line) = self.buffer.consume_line() {
                return Ok(line);
            }
        }
    }

    /// Write the whole buffer, retrying on EINTR.
    pub fn write_all(&mut self, mut data: &[u8]) -> io::Result<()> {
        let fd = self
            .fd
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))?;
        while !data.is_empty() {
            match nix::unistd::write(fd, data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => data = &data[n..],
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
        Ok(())
    }

    /// Discard whatever the peer has already sent without blocking.
    pub fn drain(&mut self) {
        let Some(fd) = self.fd.as_ref() else {
            return;
        };
        let mut scratch = [0u8; PAGE_SIZE];
        while let Ok(true) = wait_readable(fd.as_fd(), Some(Duration::ZERO)) {
            match read_retry(fd, &mut scratch) {
                Ok(n) if n > 0 => continue,
                _ => break,
            }
        }
    }
}

fn read_retry(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match nix::unistd::read(fd, buf) {
            Ok(n) => return Ok(n),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
        }
    }
}

/// Wait until `fd` is readable. `Ok(false)` means the wait timed out.
pub(crate) fn wait_readable(fd: BorrowedFd<'_>, timeout: Option<Duration>) -> io::Result<bool> {
    let timeout_ms: libc::c_int = match timeout {
        None => -1,
        Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
    };
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        // SAFETY: pfd is a valid pollfd for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(rc > 0);
    }
}
