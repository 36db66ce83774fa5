//! Unix (Linux and macOS) process backend.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};

use tracing::{debug, warn};

use super::{Backend, ConsoleListener, ConsoleStream, EXIT_CODE_UNKNOWN};
use crate::args::ArgumentList;

pub(crate) struct UnixBackend;

impl Backend for UnixBackend {
    const EXE_SUFFIX: &'static str = "";

    type Listener = SocketListener;

    fn is_executable(path: &Path) -> bool {
        let is_file = std::fs::metadata(path).map(|m| m.is_file()).unwrap_or(false);
        if !is_file {
            return false;
        }
        let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
            return false;
        };
        // SAFETY: `c_path` is a valid NUL-terminated string for the duration of the call.
        unsafe { libc::access(c_path.as_ptr(), libc::X_OK) == 0 }
    }

    #[cfg(target_os = "macos")]
    fn install_dirs() -> Vec<PathBuf> {
        [
            "/usr/local/bin",
            "/opt/homebrew/bin",
            "/usr/local/Cellar/qemu",
            "/opt/homebrew/Cellar/qemu",
            "/Applications/QEMU.app/Contents/MacOS",
            "/usr/bin",
            "/opt/qemu/bin",
        ]
        .into_iter()
        .map(PathBuf::from)
        .collect()
    }

    // Linux distributions install QEMU somewhere on PATH.
    #[cfg(not(target_os = "macos"))]
    fn install_dirs() -> Vec<PathBuf> {
        Vec::new()
    }

    fn install_record() -> Option<PathBuf> {
        None
    }

    fn configure(cmd: &mut Command, args: &ArgumentList) {
        cmd.args(args.args());
    }

    fn console_device(address: &str) -> String {
        format!("unix:{address}")
    }

    fn listen(address: &str) -> io::Result<Self::Listener> {
        let path = PathBuf::from(address);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // A stale socket from a crashed run would make bind fail. Anything
        // else at the address is left alone.
        match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_socket() => {
                std::fs::remove_file(&path)?;
                debug!(path = %path.display(), "removed stale console socket");
            }
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a socket", path.display()),
                ));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        Ok(SocketListener { listener, path })
    }

    fn request_stop(child: &mut Child) -> io::Result<()> {
        let pid = libc::pid_t::try_from(child.id())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        // SAFETY: plain syscall; `pid` is our own unreaped child so it cannot
        // have been recycled for another process.
        if unsafe { libc::kill(pid, libc::SIGTERM) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn exit_code(status: ExitStatus) -> i32 {
        status
            .code()
            .or_else(|| status.signal().map(|sig| 128 + sig))
            .unwrap_or(EXIT_CODE_UNKNOWN)
    }
}

/// Listening console socket. The socket file is removed on drop.
pub(crate) struct SocketListener {
    listener: UnixListener,
    path: PathBuf,
}

impl ConsoleListener for SocketListener {
    type Stream = UnixStream;

    fn try_accept(&mut self) -> io::Result<Option<UnixStream>> {
        match self.listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                Ok(Some(stream))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove console socket");
            }
        }
    }
}

impl ConsoleStream for UnixStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn shutdown_stream(&self) -> io::Result<()> {
        match self.shutdown(std::net::Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}
