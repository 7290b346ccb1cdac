//! Path utilities for sockets, pid files and logs.

use std::path::{Path, PathBuf};

/// Socket name of the parent's control plane.
pub const LISTENER_SOCKNAME: &str = "listener";

/// Process name of the parent.
pub const MAIN_PROCNAME: &str = "main";

/// Default socket directory for an instance name: `/tmp/<name>`.
pub fn default_socket_dir(name: &str) -> PathBuf {
    PathBuf::from("/tmp").join(name)
}

/// Default ckdb socket directory: `/opt/<ckdb_name>`.
pub fn default_ckdb_sockdir(ckdb_name: &str) -> PathBuf {
    PathBuf::from("/opt").join(ckdb_name)
}

/// Default config file name: `<name>.conf`.
pub fn default_config_path(name: &str) -> PathBuf {
    PathBuf::from(format!("{name}.conf"))
}

/// Unix socket path for a role: `<socket_dir>/<sockname>`.
pub fn socket_path<P: AsRef<Path>>(socket_dir: P, sockname: &str) -> PathBuf {
    socket_dir.as_ref().join(sockname)
}

/// Pid file path for a role: `<socket_dir>/<procname>.pid`.
///
/// # Examples
///
/// ```
/// use std::path::PathBuf;
/// use ckpool::paths::pid_path;
///
/// assert_eq!(pid_path("/tmp/ckpool", "connector"), PathBuf::from("/tmp/ckpool/connector.pid"));
/// ```
pub fn pid_path<P: AsRef<Path>>(socket_dir: P, procname: &str) -> PathBuf {
    socket_dir.as_ref().join(format!("{procname}.pid"))
}

/// The control-plane socket for an instance rooted at `socket_dir`.
pub fn listener_path<P: AsRef<Path>>(socket_dir: P) -> PathBuf {
    socket_path(socket_dir, LISTENER_SOCKNAME)
}

/// Log file path: `<logdir>/<name>.log`.
pub fn log_file_path<P: AsRef<Path>>(logdir: P, name: &str) -> PathBuf {
    logdir.as_ref().join(format!("{name}.log"))
}

/// Create `dir` (mode 0750) unless it already exists.
pub fn ensure_dir<P: AsRef<Path>>(dir: P) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    match std::fs::DirBuilder::new().mode(0o750).create(dir.as_ref()) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}
