//! Error type for launcher operations.

use std::path::PathBuf;

/// Why a launch (or a launch-profile load) failed.
///
/// Every variant carries enough context to be shown to a user as-is; the
/// `Display` output is the diagnostic the launcher logs before returning.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// A required setting is missing or empty.
    #[error("{0} is not set")]
    Configuration(&'static str),

    /// A configured file does not exist.
    #[error("{what} not found at: {}", path.display())]
    NotFound { what: &'static str, path: PathBuf },

    /// The operating system refused to create the process.
    #[error("failed to spawn {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The emulator never attached to the console channel.
    #[error("console handshake failed: {0}")]
    Handshake(String),

    /// A lifecycle operation was requested in a state that does not allow it.
    #[error("emulator is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    /// A launch profile could not be read or parsed.
    #[error("invalid launch profile {}: {reason}", path.display())]
    Profile { path: PathBuf, reason: String },
}

impl LaunchError {
    pub(crate) fn not_found(what: &'static str, path: impl Into<PathBuf>) -> Self {
        Self::NotFound {
            what,
            path: path.into(),
        }
    }
}
