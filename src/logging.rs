//! Tracing setup for the `qemu-launch` binary.
//!
//! stderr always gets human-readable output filtered by `RUST_LOG` (default
//! `warn`). With `QEMU_LAUNCHER_LOG=1` a second layer appends plain-text
//! records, including the `qemu-<channel>` reader thread names, to
//! `qemu-launcher.log` in [`LauncherPaths::logs`], and the default level
//! rises to `info`.
//!
//! Keep the returned [`LogGuard`] alive until exit or buffered file records
//! are lost.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::paths::LauncherPaths;

/// Environment switch for the file layer.
pub const FILE_LOG_VARIABLE: &str = "QEMU_LAUNCHER_LOG";

const LOG_FILE_NAME: &str = "qemu-launcher.log";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Install the global subscriber. Call once, early in `main`.
pub fn init(paths: &LauncherPaths) -> LogGuard {
    let file_logging = file_logging_requested(std::env::var(FILE_LOG_VARIABLE).ok().as_deref());
    let default_level = if file_logging { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    // Without a usable log directory the file layer is skipped.
    let file = file_logging
        .then(|| std::fs::create_dir_all(&paths.logs).ok())
        .flatten()
        .map(|()| {
            let appender = tracing_appender::rolling::never(&paths.logs, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true);
            (layer, guard)
        });
    let (file_layer, file_guard) = file.unzip();

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    LogGuard {
        _file_guard: file_guard,
    }
}

fn file_logging_requested(value: Option<&str>) -> bool {
    value.map(str::trim) == Some("1")
}
