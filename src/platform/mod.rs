//! Native process model.
//!
//! Unix spawns with an argv vector, signals with `kill(2)` and exposes the
//! console as a Unix domain socket. Windows spawns from a single quoted
//! command line, stops via console control events and exposes the console as
//! a named pipe. Both sit behind [`Backend`]; the implementation is picked at
//! compile time.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};

use crate::args::ArgumentList;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub(crate) type Native = unix::UnixBackend;
#[cfg(windows)]
pub(crate) type Native = windows::WindowsBackend;

/// Reported to the on-exit handler when the OS supplies no exit code.
pub const EXIT_CODE_UNKNOWN: i32 = -1;

/// Operations that differ between native process models.
pub(crate) trait Backend {
    /// Appended to the system name when probing for executables.
    const EXE_SUFFIX: &'static str;


    type Listener: ConsoleListener;

    /// Exists, is a regular file, and may be executed by the current user.
    fn is_executable(path: &Path) -> bool;

    /// Conventional install directories, highest priority first.
    fn install_dirs() -> Vec<PathBuf>;

    /// Install directory recorded by the platform's QEMU installer, if any.
    fn install_record() -> Option<PathBuf>;

    /// Attach everything after the program token to `cmd`.
    fn configure(cmd: &mut Command, args: &ArgumentList);

    /// QEMU character-device argument that connects to the listener at `address`.
    fn console_device(address: &str) -> String;

    /// Prepare the parent side of the console at `address`. On Unix this
    /// binds the socket QEMU connects to; on Windows QEMU owns the pipe and
    /// nothing is opened until [`ConsoleListener::try_accept`].
    fn listen(address: &str) -> io::Result<Self::Listener>;

    /// Ask the child to shut down cooperatively.
    fn request_stop(child: &mut Child) -> io::Result<()>;

    fn exit_code(status: ExitStatus) -> i32;
}

/// Parent side of the console rendezvous.
pub(crate) trait ConsoleListener: Send {
    type Stream: ConsoleStream;

    /// `Ok(None)` until the console connection is up.
    fn try_accept(&mut self) -> io::Result<Option<Self::Stream>>;
}

/// A connected, duplex console endpoint.
pub(crate) trait ConsoleStream: Read + Write + Send + Sized + 'static {
    fn try_clone_stream(&self) -> io::Result<Self>;

    /// Close both directions so a reader blocked on this stream wakes up.
    fn shutdown_stream(&self) -> io::Result<()>;
}

pub(crate) type Console = <<Native as Backend>::Listener as ConsoleListener>::Stream;
