//! Launcher configuration and TOML launch profiles.
//!
//! [`LauncherConfig`] is the facade's mutable configuration surface. A
//! [`LaunchProfile`] is the on-disk form of the same settings; every field
//! is optional and only the fields present override the configuration.
//!
//! ```toml
//! qemu_path = "/opt/qemu/bin/qemu-system-riscv64"
//! bios = "firmware/opensbi.bin"
//! arguments = ["-machine", "virt", "-nographic"]
//! handshake_timeout_ms = 5000
//! console_flag = "-serial"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::args::ArgumentList;
use crate::error::LaunchError;
use crate::lifecycle::LaunchPlan;
use crate::paths::LauncherPaths;
use crate::platform::{Backend, Native};
use crate::resolver::{Resolution, ResolutionSource};

/// Time allowed for the emulator to attach to the console.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// QEMU option that binds the guest console to a character device.
pub const DEFAULT_CONSOLE_FLAG: &str = "-serial";

// ---------------------------------------------------------------------------
// LauncherConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct LauncherConfig {
    pub(crate) system: String,
    /// Empty until resolved or set.
    pub(crate) qemu_path: String,
    pub(crate) qemu_source: Option<ResolutionSource>,
    pub(crate) bios: String,
    pub(crate) arguments: Vec<String>,
    pub(crate) handshake_timeout: Duration,
    pub(crate) console_flag: String,
    /// Fixed console address; a fresh one per start when `None`.
    pub(crate) console_address: Option<String>,
}

impl LauncherConfig {
    pub(crate) fn new(system: &str, resolution: Option<Resolution>) -> Self {
        let (qemu_path, qemu_source) = match resolution {
            Some(r) => (r.path.to_string_lossy().into_owned(), Some(r.source)),
            None => (String::new(), None),
        };
        Self {
            system: system.to_string(),
            qemu_path,
            qemu_source,
            bios: String::new(),
            arguments: Vec::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            console_flag: DEFAULT_CONSOLE_FLAG.to_string(),
            console_address: None,
        }
    }

    pub(crate) fn set_qemu_path(&mut self, path: &str) {
        self.qemu_path = path.to_string();
        self.qemu_source = Some(ResolutionSource::Override);
    }

    /// Overlay every field present in `profile`. Profile arguments are
    /// appended after the ones already configured.
    pub(crate) fn apply(&mut self, profile: &LaunchProfile) {
        if let Some(path) = &profile.qemu_path {
            self.set_qemu_path(&path.to_string_lossy());
        }
        if let Some(bios) = &profile.bios {
            self.bios = bios.to_string_lossy().into_owned();
        }
        self.arguments.extend(profile.arguments.iter().cloned());
        if let Some(ms) = profile.handshake_timeout_ms {
            self.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(flag) = &profile.console_flag {
            self.console_flag = flag.clone();
        }
    }

    /// Start preconditions, in order: executable set and present, then
    /// firmware set and present.
    pub(crate) fn validate(&self) -> Result<(), LaunchError> {
        if self.qemu_path.is_empty() {
            return Err(LaunchError::Configuration("QEMU executable path"));
        }
        if !Path::new(&self.qemu_path).is_file() {
            return Err(LaunchError::not_found("QEMU executable", &self.qemu_path));
        }
        if self.bios.is_empty() {
            return Err(LaunchError::Configuration("BIOS file path"));
        }
        if !Path::new(&self.bios).is_file() {
            return Err(LaunchError::not_found("BIOS file", &self.bios));
        }
        Ok(())
    }

    /// Validate and assemble the argv for one start, console device last.
    pub(crate) fn plan(&self, paths: &LauncherPaths) -> Result<LaunchPlan, LaunchError> {
        self.validate()?;

        let console_address = self
            .console_address
            .clone()
            .unwrap_or_else(|| paths.console_address());
        let mut args = ArgumentList::build(&self.qemu_path, &self.bios, &self.arguments);
        args.push(self.console_flag.as_str());
        args.push(Native::console_device(&console_address));
        debug!(command_line = %args.to_command_line(), "launch plan");

        Ok(LaunchPlan {
            args,
            console_address,
            handshake_timeout: self.handshake_timeout,
        })
    }
}

// ---------------------------------------------------------------------------
// LaunchProfile
// ---------------------------------------------------------------------------

/// On-disk launch settings.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct LaunchProfile {
    pub qemu_path: Option<PathBuf>,
    /// Relative paths are resolved against the profile's directory by [`load`](Self::load).
    pub bios: Option<PathBuf>,
    pub arguments: Vec<String>,
    pub handshake_timeout_ms: Option<u64>,
    pub console_flag: Option<String>,
}

impl LaunchProfile {
    /// Deserialize from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Serialize to a pretty-printed TOML string.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Read a profile file. Relative `qemu_path` and `bios` entries are taken
    /// relative to the file's directory.
    pub fn load(path: &Path) -> Result<Self, LaunchError> {
        let profile_error = |reason: String| LaunchError::Profile {
            path: path.to_path_buf(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| profile_error(e.to_string()))?;
        let mut profile = Self::from_toml(&text).map_err(|e| profile_error(e.to_string()))?;

        if profile.handshake_timeout_ms == Some(0) {
            return Err(profile_error("handshake_timeout_ms must be positive".into()));
        }
        if let Some(base) = path.parent() {
            profile.qemu_path = profile.qemu_path.map(|p| anchor(base, p));
            profile.bios = profile.bios.map(|p| anchor(base, p));
        }
        Ok(profile)
    }
}

fn anchor(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_relative() {
        base.join(path)
    } else {
        path
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
