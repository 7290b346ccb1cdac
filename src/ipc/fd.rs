//! Descriptor transfer over unix-domain sockets.
//!
//! One open descriptor rides as `SCM_RIGHTS` ancillary data next to a single
//! payload byte. The kernel installs a duplicate in the receiving process;
//! the sender's copy stays valid and is closed independently.

use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::error::{PoolError, Result};

const FD_PAYLOAD: u8 = b'F';

/// Send `fd` to the peer of `stream`.
pub fn send_fd(stream: &UnixStream, fd: BorrowedFd<'_>) -> Result<()> {
    let fd_size = std::mem::size_of::<libc::c_int>();
    // SAFETY: CMSG_SPACE is a pure size computation.
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let payload = [FD_PAYLOAD];
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    // SAFETY: an all-zero msghdr is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space as _;

    // SAFETY: msg_control points at a buffer sized by CMSG_SPACE for one int.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(PoolError::FdTransfer("no room for control message".into()));
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_size as u32) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::c_int, fd.as_raw_fd());
    }

    loop {
        // SAFETY: msg and the buffers it points to outlive the call.
        let n = unsafe { libc::sendmsg(stream.as_raw_fd(), &msg, 0) };
        if n >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(PoolError::FdTransfer(format!("sendmsg failed: {err}")));
        }
    }
}

/// Receive one descriptor from the peer of `stream`.
///
/// `timeout` bounds the wait; `None` blocks until the peer sends or closes.
/// The descriptor arrives close-on-exec.
pub fn recv_fd(stream: &UnixStream, timeout: Option<Duration>) -> Result<OwnedFd> {
    stream.set_read_timeout(timeout)?;

    let fd_size = std::mem::size_of::<libc::c_int>();
    // SAFETY: CMSG_SPACE is a pure size computation.
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut payload = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    // SAFETY: an all-zero msghdr is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space as _;

    let n = loop {
        // SAFETY: msg and the buffers it points to outlive the call.
        let n = unsafe { libc::recvmsg(stream.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if n >= 0 {
            break n;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(PoolError::FdTransfer(format!("recvmsg failed: {err}")));
        }
    };
    if n == 0 {
        return Err(PoolError::FdTransfer("peer closed before sending a descriptor".into()));
    }

    // SAFETY: the kernel filled msg_control up to msg_controllen.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null()
            || (*cmsg).cmsg_level != libc::SOL_SOCKET
            || (*cmsg).cmsg_type != libc::SCM_RIGHTS
        {
            return Err(PoolError::FdTransfer("reply carried no descriptor".into()));
        }
        let raw = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::c_int);
        if raw < 0 {
            return Err(PoolError::FdTransfer(format!("invalid descriptor {raw}")));
        }
        Ok(OwnedFd::from_raw_fd(raw))
    }
}

/// Clear close-on-exec on `fd`.
///
/// Only calls `fcntl`, so it is safe to run between fork and exec.
pub fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor number has no memory effects.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsFd;

    #[test]
    fn test_transfer_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (holder, requester) = UnixStream::pair().unwrap();

        send_fd(&holder, listener.as_fd()).unwrap();
        drop(listener);

        let received = recv_fd(&requester, Some(Duration::from_secs(1))).unwrap();
        let inherited = TcpListener::from(received);
        assert_eq!(inherited.local_addr().unwrap(), addr);

        let mut client = TcpStream::connect(addr).unwrap();
        let (mut server_side, _) = inherited.accept().unwrap();
        client.write_all(b"hi").unwrap();
        let mut buf = [0u8; 2];
        server_side.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn test_recv_without_descriptor_fails() {
        let (mut holder, requester) = UnixStream::pair().unwrap();
        holder.write_all(b"x").unwrap();
        let err = recv_fd(&requester, Some(Duration::from_secs(1))).unwrap_err();
        assert!(matches!(err, PoolError::FdTransfer(_)));
    }

    #[test]
    fn test_recv_after_peer_close_fails() {
        let (holder, requester) = UnixStream::pair().unwrap();
        drop(holder);
        assert!(recv_fd(&requester, Some(Duration::from_secs(1))).is_err());
    }

    fn cloexec(fd: RawFd) -> bool {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        flags & libc::FD_CLOEXEC != 0
    }

    #[test]
    fn test_received_descriptor_is_cloexec() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        clear_cloexec(listener.as_raw_fd()).unwrap();
        let (holder, requester) = UnixStream::pair().unwrap();

        send_fd(&holder, listener.as_fd()).unwrap();
        let received = recv_fd(&requester, Some(Duration::from_secs(1))).unwrap();
        assert!(!cloexec(listener.as_raw_fd()));
        assert!(cloexec(received.as_raw_fd()));
    }

    #[test]
    fn test_clear_cloexec() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        assert!(cloexec(listener.as_raw_fd()));
        clear_cloexec(listener.as_raw_fd()).unwrap();
        assert!(!cloexec(listener.as_raw_fd()));
    }
}
