//! QEMU executable discovery.
//!
//! Resolution order, first match wins:
//!
//! 1. an explicit override path (returned as-is, no search)
//! 2. `$QEMU_ROOT/<system>`
//! 3. each directory of `$PATH`, in listed order
//! 4. the platform's conventional install directories
//! 5. the platform's install-directory record (Windows registry)
//!
//! A candidate counts only if it is a regular file the current user may
//! execute. The environment is captured once by [`ExecutableResolver::from_env`]
//! so the search itself depends only on that snapshot and the filesystem.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::platform::{Backend, Native};

/// Environment variable naming the QEMU installation root.
pub const ROOT_VARIABLE: &str = "QEMU_ROOT";

/// Which search strategy produced a [`Resolution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Override,
    RootVariable,
    SearchPath,
    InstallDir,
    InstallRecord,
}

/// A resolved executable and where it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub path: PathBuf,
    pub source: ResolutionSource,
}

/// Snapshot of everything the search consults.
#[derive(Debug, Clone, Default)]
pub struct ExecutableResolver {
    override_path: Option<PathBuf>,
    root: Option<OsString>,
    search_path: Option<OsString>,
    install_dirs: Vec<PathBuf>,
    install_record: Option<PathBuf>,
    current_dir: Option<PathBuf>,
}

impl ExecutableResolver {
    /// A resolver that searches nothing until configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture `QEMU_ROOT`, `PATH`, the working directory and the platform's
    /// install locations.
    pub fn from_env() -> Self {
        Self {
            override_path: None,
            root: std::env::var_os(ROOT_VARIABLE),
            search_path: std::env::var_os("PATH"),
            install_dirs: Native::install_dirs(),
            install_record: Native::install_record(),
            current_dir: std::env::current_dir().ok(),
        }
    }

    pub fn with_override(mut self, path: impl Into<PathBuf>) -> Self {
        self.override_path = Some(path.into());
        self
    }

    pub fn with_root(mut self, root: impl Into<OsString>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn with_search_path(mut self, path: impl Into<OsString>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    pub fn with_install_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.install_dirs = dirs;
        self
    }

    pub fn with_install_record(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_record = Some(dir.into());
        self
    }

    /// Directory that stands in for empty `PATH` segments and relative entries.
    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Find the executable for `system` (e.g. `qemu-system-arm`).
    pub fn resolve(&self, system: &str) -> Option<Resolution> {
        if let Some(path) = &self.override_path {
            return Some(Resolution {
                path: path.clone(),
                source: ResolutionSource::Override,
            });
        }

        let found = self
            .from_root(system)
            .map(|p| (p, ResolutionSource::RootVariable))
            .or_else(|| self.from_search_path(system).map(|p| (p, ResolutionSource::SearchPath)))
            .or_else(|| self.from_install_dirs(system).map(|p| (p, ResolutionSource::InstallDir)))
            .or_else(|| {
                self.install_record
                    .as_deref()
                    .and_then(|dir| self.candidate(dir, system))
                    .map(|p| (p, ResolutionSource::InstallRecord))
            });

        match found {
            Some((path, source)) => {
                debug!(system, path = %path.display(), ?source, "resolved QEMU executable");
                Some(Resolution { path, source })
            }
            None => {
                debug!(system, "QEMU executable not found");
                None
            }
        }
    }

    fn from_root(&self, system: &str) -> Option<PathBuf> {
        let root = self.root.as_ref().filter(|r| !r.is_empty())?;
        self.candidate(Path::new(root), system)
    }

    fn from_search_path(&self, system: &str) -> Option<PathBuf> {
        let search_path = self.search_path.as_ref()?;
        std::env::split_paths(search_path).find_map(|dir| self.candidate(&dir, system))
    }

    fn from_install_dirs(&self, system: &str) -> Option<PathBuf> {
        self.install_dirs
            .iter()
            .find_map(|dir| self.candidate(dir, system))
    }

    /// `dir/<system><suffix>` if that names a valid executable.
    ///
    /// `system` must be a single plain path component, so the candidate can
    /// never escape `dir`.
    fn candidate(&self, dir: &Path, system: &str) -> Option<PathBuf> {
        let mut components = Path::new(system).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) || system.ends_with(std::path::is_separator)
        {
            return None;
        }

        let dir = if dir.as_os_str().is_empty() || dir.is_relative() {
            self.current_dir.as_deref()?.join(dir)
        } else {
            dir.to_path_buf()
        };

        let path = dir.join(format!("{system}{}", Native::EXE_SUFFIX));
        Native::is_executable(&path).then_some(path)
    }
}

/// Resolve `system` against the current process environment.
pub fn find_qemu_executable(system: &str) -> Option<PathBuf> {
    ExecutableResolver::from_env()
        .resolve(system)
        .map(|resolution| resolution.path)
}
