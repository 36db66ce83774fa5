//! Launch and supervise a QEMU process.
//!
//! ```no_run
//! use qemu_launcher::Launcher;
//!
//! let mut launcher = Launcher::new("qemu-system-x86_64");
//! launcher.set_bios("/usr/share/ovmf/OVMF.fd");
//! launcher.add_argument("-nographic");
//! launcher.on_serial(|text| print!("{text}"));
//! launcher.on_exit(|code| eprintln!("QEMU exited with {code}"));
//!
//! launcher.start()?;
//! launcher.write_console("root\n");
//! launcher.stop();
//! # Ok::<(), qemu_launcher::LaunchError>(())
//! ```

pub mod args;
mod bridge;
pub mod config;
pub mod error;
pub mod launcher;
mod lifecycle;
pub mod logging;
pub mod paths;
mod platform;
pub mod resolver;
mod state_machine;

pub use args::{ArgumentList, split_command_line};
pub use bridge::Channel;
pub use bridge::callbacks::{ExitHandler, TextHandler};
pub use config::{DEFAULT_CONSOLE_FLAG, DEFAULT_HANDSHAKE_TIMEOUT, LaunchProfile};
pub use error::LaunchError;
pub use launcher::Launcher;
pub use lifecycle::ProcessState;
pub use platform::EXIT_CODE_UNKNOWN;
pub use resolver::{
    ExecutableResolver, ROOT_VARIABLE, Resolution, ResolutionSource, find_qemu_executable,
};
