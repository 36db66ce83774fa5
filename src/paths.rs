//! Directory layout for qemu-launcher.
//!
//! Provides a single `LauncherPaths` struct that resolves the directories the
//! launcher writes to:
//!
//! - Runtime: console sockets (`$XDG_RUNTIME_DIR/qemu-launcher/` or the temp dir)
//! - Logs:    `~/Library/Logs/qemu-launcher/` on macOS, XDG data dir elsewhere
//!
//! Nothing is created here. The console listener and the log file layer
//! create the directories they write to.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

const APP_NAME: &str = "qemu-launcher";

/// Monotonic suffix so two launchers in one process never share a console address.
static NEXT_CONSOLE_ID: AtomicU32 = AtomicU32::new(0);

/// All resolved launcher directory paths.
#[derive(Debug, Clone)]
pub struct LauncherPaths {
    /// Console sockets and other per-run scratch files
    pub runtime: PathBuf,
    /// Log files written when `QEMU_LAUNCHER_LOG=1`
    pub logs: PathBuf,
}

impl LauncherPaths {
    /// Resolve all paths from the environment.
    pub fn resolve() -> Self {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        Self {
            runtime: resolve_runtime_dir(),
            logs: resolve_log_dir(home.as_deref()),
        }
    }

    /// A fresh console address unique to this process and call.
    ///
    /// On Unix this is a socket path inside `runtime`; on Windows a pipe name
    /// in the local pipe namespace.
    pub fn console_address(&self) -> String {
        let id = NEXT_CONSOLE_ID.fetch_add(1, Ordering::Relaxed);
        let stem = format!("{APP_NAME}-{}-{id}", std::process::id());
        if cfg!(windows) {
            format!(r"\\.\pipe\{stem}")
        } else {
            self.runtime
                .join(format!("{stem}.sock"))
                .to_string_lossy()
                .into_owned()
        }
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_runtime_dir() -> PathBuf {
    // Unix socket paths are limited to ~100 bytes, so prefer the short
    // per-user runtime dir over a potentially long $TMPDIR.
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join(APP_NAME),
        _ => std::env::temp_dir().join(APP_NAME),
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: Option<&Path>) -> PathBuf {
    match home {
        Some(home) => home.join("Library").join("Logs").join(APP_NAME),
        None => std::env::temp_dir().join(APP_NAME).join("logs"),
    }
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: Option<&Path>) -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join(APP_NAME).join("logs");
    }
    match home {
        Some(home) => home.join(".local").join("share").join(APP_NAME).join("logs"),
        None => std::env::temp_dir().join(APP_NAME).join("logs"),
    }
}
