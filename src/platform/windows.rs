//! Windows process backend.
//!
//! `CreateProcessW` takes one command-line string, so arguments are quoted
//! with [`quote_arg`] and passed raw. The console is a duplex named pipe that
//! QEMU's `pipe:` backend creates during startup; the handshake keeps trying
//! to open it as a client until it appears.
//!
//! Synchronous I/O on one pipe handle is serialized by the kernel, so a
//! blocked `ReadFile` would stall every console write. [`PipeStream`] only
//! reads bytes `PeekNamedPipe` reports as available.

use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::AsRawHandle;
use std::os::windows::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use windows_sys::Win32::Foundation::{ERROR_BROKEN_PIPE, ERROR_PIPE_BUSY};
use windows_sys::Win32::System::Console::{CTRL_BREAK_EVENT, GenerateConsoleCtrlEvent};
use windows_sys::Win32::System::Pipes::{PeekNamedPipe, WaitNamedPipeW};
use windows_sys::Win32::System::Threading::CREATE_NEW_PROCESS_GROUP;
use winreg::RegKey;
use winreg::enums::HKEY_LOCAL_MACHINE;

use super::{Backend, ConsoleListener, ConsoleStream, EXIT_CODE_UNKNOWN};
use crate::args::{ArgumentList, quote_arg};

/// QEMU's `pipe:` backend adds this prefix itself.
const PIPE_NAMESPACE: &str = r"\\.\pipe\";
const PEEK_INTERVAL: Duration = Duration::from_millis(10);

pub(crate) struct WindowsBackend;

impl Backend for WindowsBackend {
    const EXE_SUFFIX: &'static str = ".exe";

    type Listener = PipeConnector;

    // No execute permission bit on Windows; existence is enough.
    fn is_executable(path: &Path) -> bool {
        std::fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
    }

    fn install_dirs() -> Vec<PathBuf> {
        ["ProgramFiles", "ProgramW6432"]
            .into_iter()
            .filter_map(std::env::var_os)
            .map(|dir| PathBuf::from(dir).join("qemu"))
            .collect()
    }

    /// `HKLM\SOFTWARE\QEMU\Install_Dir`, written by the official installer.
    fn install_record() -> Option<PathBuf> {
        let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
        let key = hklm.open_subkey("SOFTWARE\\QEMU").ok()?;
        let dir: String = key.get_value("Install_Dir").ok()?;
        Some(PathBuf::from(dir))
    }

    fn configure(cmd: &mut Command, args: &ArgumentList) {
        // Own process group so CTRL_BREAK reaches only the emulator.
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        for arg in args.args() {
            cmd.raw_arg(&*quote_arg(arg));
        }
    }

    fn console_device(address: &str) -> String {
        let name = address.strip_prefix(PIPE_NAMESPACE).unwrap_or(address);
        format!("pipe:{name}")
    }

    fn listen(address: &str) -> io::Result<Self::Listener> {
        let wide = wide_nul(address);
        Ok(PipeConnector {
            name: address.to_string(),
            wide,
        })
    }

    fn request_stop(child: &mut Child) -> io::Result<()> {
        // SAFETY: plain Win32 call with no pointer arguments.
        if unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, child.id()) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn exit_code(status: ExitStatus) -> i32 {
        status.code().unwrap_or(EXIT_CODE_UNKNOWN)
    }
}

/// Client side of the console pipe. QEMU's `pipe:` backend creates the
/// pipe itself, so the launcher connects once the instance exists.
pub(crate) struct PipeConnector {
    name: String,
    wide: Vec<u16>,
}

impl ConsoleListener for PipeConnector {
    type Stream = PipeStream;

    fn try_accept(&mut self) -> io::Result<Option<PipeStream>> {
        let opened = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.name);
        match opened {
            Ok(file) => {
                debug!(pipe = %self.name, "connected to console pipe");
                Ok(Some(PipeStream {
                    file,
                    closed: Arc::new(AtomicBool::new(false)),
                }))
            }
            // Not created yet.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY as i32) => {
                // SAFETY: `wide` is NUL-terminated and owned by `self`.
                unsafe { WaitNamedPipeW(self.wide.as_ptr(), PEEK_INTERVAL.as_millis() as u32) };
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Connected client end of the console pipe. Clones share the closed flag.
pub(crate) struct PipeStream {
    file: File,
    closed: Arc<AtomicBool>,
}

impl Read for PipeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(0);
            }
            let mut available = 0u32;
            // SAFETY: the handle stays open for the call; null buffers ask
            // only for the byte count.
            let ok = unsafe {
                PeekNamedPipe(
                    self.file.as_raw_handle(),
                    std::ptr::null_mut(),
                    0,
                    std::ptr::null_mut(),
                    &mut available,
                    std::ptr::null_mut(),
                )
            };
            if ok == 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(ERROR_BROKEN_PIPE as i32) {
                    return Ok(0);
                }
                return Err(err);
            }
            if available > 0 {
                let len = buf.len().min(available as usize);
                return self.file.read(&mut buf[..len]);
            }
            std::thread::sleep(PEEK_INTERVAL);
        }
    }
}

impl Write for PipeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl ConsoleStream for PipeStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        Ok(Self {
            file: self.file.try_clone()?,
            closed: Arc::clone(&self.closed),
        })
    }

    // A client handle cannot be disconnected; readers poll the flag, and the
    // emulator sees the pipe break when the last handle drops.
    fn shutdown_stream(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

fn wide_nul(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(std::iter::once(0)).collect()
}
