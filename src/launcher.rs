//! The public launcher facade.
//!
//! Configuration setters take `&mut self`; everything that touches the
//! running emulator takes `&self`, so a launcher can be shared across
//! threads (`Arc<Launcher>`) once configured.
//!
//! Handlers run on reader threads. They must not call `start`, `stop`,
//! `terminate` or `poll_exit` on the same launcher: teardown waits for an
//! in-flight handler to return, and a handler waiting on teardown never does.
//! Registering handlers (`on_stdout` and friends) from inside a handler is
//! fine; the replacement takes effect from the next delivery.

use std::process::ChildStdin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{info, warn};

use crate::bridge::callbacks::CallbackRegistry;
use crate::bridge::{Channel, InputSlot};
use crate::config::{LaunchProfile, LauncherConfig};
use crate::error::LaunchError;
use crate::lifecycle::{LifecycleController, ProcessState, StatusCell};
use crate::paths::LauncherPaths;
use crate::platform::Console;
use crate::resolver::{ExecutableResolver, ResolutionSource};

/// Launches and supervises one QEMU process.
pub struct Launcher {
    config: LauncherConfig,
    paths: LauncherPaths,
    callbacks: CallbackRegistry,
    status: StatusCell,
    stdin: InputSlot<ChildStdin>,
    console_in: InputSlot<Console>,
    controller: Mutex<LifecycleController>,
}

impl Launcher {
    /// A launcher for `system` (e.g. `qemu-system-x86_64`), with the
    /// executable resolved from the current environment.
    pub fn new(system: &str) -> Self {
        Self::with_resolver(system, &ExecutableResolver::from_env())
    }

    /// A launcher whose executable is resolved by `resolver`.
    pub fn with_resolver(system: &str, resolver: &ExecutableResolver) -> Self {
        let resolution = resolver.resolve(system);
        match &resolution {
            Some(r) => info!(system, path = %r.path.display(), source = ?r.source, "QEMU executable found"),
            None => warn!(system, "QEMU executable not found; set it with set_qemu_path"),
        }

        let status = StatusCell::default();
        let stdin = InputSlot::new(Channel::Stdin);
        let console_in = InputSlot::new(Channel::Console);
        let controller =
            LifecycleController::new(system, status.clone(), stdin.clone(), console_in.clone());

        Self {
            config: LauncherConfig::new(system, resolution),
            paths: LauncherPaths::resolve(),
            callbacks: CallbackRegistry::default(),
            status,
            stdin,
            console_in,
            controller: Mutex::new(controller),
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Override the executable, bypassing resolution.
    pub fn set_qemu_path(&mut self, path: &str) {
        self.config.set_qemu_path(path);
    }

    pub fn set_bios(&mut self, path: &str) {
        self.config.bios = path.to_string();
    }

    /// Append one argument after the firmware pair. Order and duplicates are kept.
    pub fn add_argument(&mut self, arg: impl Into<String>) {
        self.config.arguments.push(arg.into());
    }

    pub fn set_handshake_timeout(&mut self, timeout: Duration) {
        self.config.handshake_timeout = timeout;
    }

    /// Use a fixed console address (socket path or pipe name) instead of a
    /// fresh one in the runtime directory.
    pub fn set_console_address(&mut self, address: impl Into<String>) {
        self.config.console_address = Some(address.into());
    }

    pub fn apply_profile(&mut self, profile: &LaunchProfile) {
        self.config.apply(profile);
    }

    pub fn system(&self) -> &str {
        &self.config.system
    }

    /// Empty if resolution failed and nothing was set.
    pub fn qemu_path(&self) -> &str {
        &self.config.qemu_path
    }

    /// How [`qemu_path`](Self::qemu_path) was obtained.
    pub fn qemu_source(&self) -> Option<ResolutionSource> {
        self.config.qemu_source
    }

    pub fn bios(&self) -> &str {
        &self.config.bios
    }

    pub fn arguments(&self) -> &[String] {
        &self.config.arguments
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.config.handshake_timeout
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    pub fn on_stdout(&self, handler: impl FnMut(&str) + Send + 'static) {
        self.callbacks.stdout.replace(Box::new(handler));
    }

    pub fn on_stderr(&self, handler: impl FnMut(&str) + Send + 'static) {
        self.callbacks.stderr.replace(Box::new(handler));
    }

    /// Text the guest writes to its serial console.
    pub fn on_serial(&self, handler: impl FnMut(&str) + Send + 'static) {
        self.callbacks.console.replace(Box::new(handler));
    }

    /// Called with the exit code once the emulator has been reaped.
    pub fn on_exit(&self, handler: impl FnMut(i32) + Send + 'static) {
        self.callbacks.exit.replace(Box::new(handler));
    }

    // ------------------------------------------------------------------
    // I/O
    // ------------------------------------------------------------------

    /// Write to the emulator's stdin. `false` when not running or on error.
    pub fn write_stdin(&self, data: impl AsRef<[u8]>) -> bool {
        self.stdin.write(data.as_ref())
    }

    /// Write to the guest's serial console. `false` when not running or on error.
    pub fn write_console(&self, data: impl AsRef<[u8]>) -> bool {
        self.console_in.write(data.as_ref())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Spawn the emulator and wait until it attaches to the console.
    pub fn start(&self) -> Result<(), LaunchError> {
        let mut controller = self.controller();
        let result = self
            .config
            .plan(&self.paths)
            .and_then(|plan| controller.start(plan, &self.callbacks));
        if let Err(e) = &result {
            warn!(system = %self.config.system, error = %e, "failed to start QEMU");
        }
        result
    }

    /// Ask the emulator to shut down and wait for it. `true` if a running
    /// emulator was reaped.
    pub fn stop(&self) -> bool {
        let code = self.controller().stop();
        self.reaped(code)
    }

    /// Kill the emulator and wait for it. `true` if a running emulator was reaped.
    pub fn terminate(&self) -> bool {
        let code = self.controller().terminate();
        self.reaped(code)
    }

    /// Reap the emulator if it has exited on its own. Never blocks on the child.
    pub fn poll_exit(&self) -> Option<i32> {
        let code = self.controller().poll_exit();
        self.reaped(code);
        code
    }

    pub fn state(&self) -> ProcessState {
        self.status.get().state
    }

    /// Pid of the live emulator.
    pub fn pid(&self) -> Option<u32> {
        self.status.get().pid
    }

    /// Exit code of the last reaped emulator, until the next start.
    pub fn exit_code(&self) -> Option<i32> {
        self.status.get().exit_code
    }

    fn controller(&self) -> MutexGuard<'_, LifecycleController> {
        self.controller.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Runs after the controller lock is released.
    fn reaped(&self, code: Option<i32>) -> bool {
        match code {
            Some(code) => {
                self.callbacks.notify_exit(code);
                true
            }
            None => false,
        }
    }
}

impl Drop for Launcher {
    fn drop(&mut self) {
        if !self.stop() {
            self.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unresolved() -> Launcher {
        Launcher::with_resolver("qemu-system-x86_64", &ExecutableResolver::new())
    }

    #[test]
    fn arguments_keep_order_and_duplicates() {
        let mut launcher = unresolved();
        for arg in ["-m", "512", "-nographic", "-m", "512"] {
            launcher.add_argument(arg);
        }
        assert_eq!(launcher.arguments(), ["-m", "512", "-nographic", "-m", "512"]);
    }

    #[test]
    fn unresolved_launcher_refuses_to_start() {
        let launcher = unresolved();
        assert_eq!(launcher.qemu_path(), "");
        assert_eq!(launcher.qemu_source(), None);
        assert!(matches!(launcher.start(), Err(LaunchError::Configuration(_))));
        assert_eq!(launcher.state(), ProcessState::NotStarted);
        assert_eq!(launcher.pid(), None);
    }

    #[test]
    fn writes_before_start_are_dropped() {
        let launcher = unresolved();
        assert!(!launcher.write_stdin("info status\n"));
        assert!(!launcher.write_console(b"root\n"));
        assert!(!launcher.stop());
        assert!(!launcher.terminate());
        assert_eq!(launcher.poll_exit(), None);
    }

    #[test]
    fn override_is_reported_as_source() {
        let resolver = ExecutableResolver::new().with_override("/opt/qemu/bin/qemu-system-arm");
        let mut launcher = Launcher::with_resolver("qemu-system-arm", &resolver);
        assert_eq!(launcher.qemu_path(), "/opt/qemu/bin/qemu-system-arm");
        assert_eq!(launcher.qemu_source(), Some(ResolutionSource::Override));

        launcher.set_qemu_path("/usr/bin/qemu-system-arm");
        launcher.set_bios("/fw/bios.bin");
        assert_eq!(launcher.qemu_path(), "/usr/bin/qemu-system-arm");
        assert_eq!(launcher.bios(), "/fw/bios.bin");
        assert_eq!(launcher.system(), "qemu-system-arm");
    }

    #[test]
    fn launcher_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Launcher>();
    }
}
