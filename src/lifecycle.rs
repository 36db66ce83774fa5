//! Emulator process lifecycle: spawn, console handshake, stop, reap.
//!
//! [`LifecycleController`] is the only owner of the child process. Every
//! method runs under the facade's controller lock, so transitions are
//! serialized; readers of [`StatusCell`] never take that lock.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use statig::prelude::*;
use tracing::{debug, info, warn};

use crate::args::ArgumentList;
use crate::bridge::callbacks::CallbackRegistry;
use crate::bridge::{IoBridge, InputSlot, READER_GRACE};
use crate::error::LaunchError;
use crate::platform::{Backend, Console, ConsoleListener, EXIT_CODE_UNKNOWN, Native};
use crate::state_machine::lifecycle_sm::{LifecycleEvent, LifecycleMachine};

/// How often the handshake checks the listener and the child.
const HANDSHAKE_POLL: Duration = Duration::from_millis(10);

/// Observable lifecycle state of a launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessState {
    #[default]
    NotStarted,
    Running,
    Stopping,
    Exited,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcessState::NotStarted => "not started",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Exited => "exited",
        })
    }
}

/// Snapshot published after every transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Status {
    pub(crate) state: ProcessState,
    pub(crate) pid: Option<u32>,
    pub(crate) exit_code: Option<i32>,
}

/// Shared, lock-cheap view of the controller's [`Status`].
#[derive(Debug, Clone, Default)]
pub(crate) struct StatusCell {
    inner: Arc<Mutex<Status>>,
}

impl StatusCell {
    pub(crate) fn get(&self) -> Status {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, status: Status) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

/// Everything `start` needs, validated by the configuration layer.
#[derive(Debug, Clone)]
pub(crate) struct LaunchPlan {
    /// Full argv including the console device arguments.
    pub(crate) args: ArgumentList,
    pub(crate) console_address: String,
    pub(crate) handshake_timeout: Duration,
}

/// A running child and its bridged channels.
struct Session {
    child: Child,
    bridge: IoBridge,
}

pub(crate) struct LifecycleController {
    machine: StateMachine<LifecycleMachine>,
    session: Option<Session>,
    status: StatusCell,
    stdin: InputSlot<ChildStdin>,
    console_in: InputSlot<Console>,
}

impl LifecycleController {
    pub(crate) fn new(
        system: &str,
        status: StatusCell,
        stdin: InputSlot<ChildStdin>,
        console_in: InputSlot<Console>,
    ) -> Self {
        Self {
            machine: LifecycleMachine::new(system).state_machine(),
            session: None,
            status,
            stdin,
            console_in,
        }
    }

    /// Spawn the emulator and wait for it to attach to the console.
    ///
    /// All-or-nothing: on any error the child is killed and reaped, every
    /// endpoint is closed and the state is unchanged.
    pub(crate) fn start(
        &mut self,
        plan: LaunchPlan,
        callbacks: &CallbackRegistry,
    ) -> Result<(), LaunchError> {
        if let Some(pid) = LifecycleMachine::pid(self.machine.state()) {
            return Err(LaunchError::AlreadyRunning { pid });
        }

        let program = PathBuf::from(plan.args.program());
        let mut listener = Native::listen(&plan.console_address).map_err(|e| {
            LaunchError::Handshake(format!(
                "cannot listen on console {}: {e}",
                plan.console_address
            ))
        })?;

        let mut cmd = Command::new(&program);
        Native::configure(&mut cmd, &plan.args);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            path: program.clone(),
            source,
        })?;
        let pid = child.id();
        info!(pid, path = %program.display(), "QEMU spawned");

        let console = match handshake(&mut child, &mut listener, plan.handshake_timeout) {
            Ok(console) => console,
            Err(reason) => {
                warn!(pid, %reason, "console handshake failed; rolling back");
                discard(child);
                return Err(LaunchError::Handshake(reason));
            }
        };
        // The emulator holds its end now; the rendezvous point can go.
        drop(listener);

        let bridge = match IoBridge::attach(
            &mut child,
            console,
            callbacks,
            &self.stdin,
            &self.console_in,
        ) {
            Ok(bridge) => bridge,
            Err(source) => {
                warn!(pid, error = %source, "failed to bridge QEMU I/O; rolling back");
                discard(child);
                return Err(LaunchError::Spawn {
                    path: program,
                    source,
                });
            }
        };

        self.session = Some(Session { child, bridge });
        self.machine.handle(&LifecycleEvent::Spawned { pid });
        self.publish();
        Ok(())
    }

    /// Graceful stop, falling back to a forced kill when the request cannot
    /// be delivered. Blocks until the child is reaped.
    pub(crate) fn stop(&mut self) -> Option<i32> {
        let mut session = self.session.take()?;
        self.begin_stop();

        let pid = session.child.id();
        if let Err(e) = Native::request_stop(&mut session.child) {
            warn!(pid, error = %e, "graceful stop failed; killing QEMU");
            kill(&mut session.child);
        }
        let status = session.child.wait();
        Some(self.finish(session, status))
    }

    /// Forced kill. Blocks until the child is reaped.
    pub(crate) fn terminate(&mut self) -> Option<i32> {
        let mut session = self.session.take()?;
        self.begin_stop();

        kill(&mut session.child);
        let status = session.child.wait();
        Some(self.finish(session, status))
    }

    /// Reap the child if it has already exited on its own.
    pub(crate) fn poll_exit(&mut self) -> Option<i32> {
        let session = self.session.as_mut()?;
        match session.child.try_wait() {
            Ok(Some(status)) => {
                let session = self.session.take()?;
                Some(self.finish(session, Ok(status)))
            }
            Ok(None) => None,
            Err(e) => {
                warn!(pid = session.child.id(), error = %e, "failed to poll QEMU");
                None
            }
        }
    }

    fn begin_stop(&mut self) {
        self.machine.handle(&LifecycleEvent::StopRequested);
        self.publish();
    }

    fn finish(&mut self, session: Session, status: io::Result<ExitStatus>) -> i32 {
        let Session { child, bridge } = session;
        let code = match status {
            Ok(status) => Native::exit_code(status),
            Err(e) => {
                warn!(pid = child.id(), error = %e, "failed to reap QEMU");
                EXIT_CODE_UNKNOWN
            }
        };
        bridge.close(READER_GRACE);
        drop(child);

        self.machine.handle(&LifecycleEvent::Reaped { code });
        self.publish();
        code
    }

    fn publish(&self) {
        let state = self.machine.state();
        self.status.set(Status {
            state: LifecycleMachine::process_state(state),
            pid: LifecycleMachine::pid(state),
            exit_code: LifecycleMachine::exit_code(state),
        });
    }
}

/// Poll until the emulator connects, exits, or `timeout` passes.
fn handshake<L: ConsoleListener>(
    child: &mut Child,
    listener: &mut L,
    timeout: Duration,
) -> Result<L::Stream, String> {
    let deadline = Instant::now() + timeout;
    loop {
        match listener.try_accept() {
            Ok(Some(stream)) => {
                debug!(pid = child.id(), "console connected");
                return Ok(stream);
            }
            Ok(None) => {}
            Err(e) => return Err(format!("console accept failed: {e}")),
        }

        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(format!(
                    "QEMU exited during startup with code {}",
                    Native::exit_code(status)
                ));
            }
            Ok(None) => {}
            Err(e) => return Err(format!("failed to poll QEMU: {e}")),
        }

        if Instant::now() >= deadline {
            return Err(format!(
                "QEMU did not connect to the console within {} ms",
                timeout.as_millis()
            ));
        }
        std::thread::sleep(HANDSHAKE_POLL);
    }
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        // InvalidInput means it already exited; the wait below reaps it.
        if e.kind() != io::ErrorKind::InvalidInput {
            warn!(pid = child.id(), error = %e, "failed to kill QEMU");
        }
    }
}

/// Kill and reap a child that never reached Running. Its pipes close on drop.
fn discard(mut child: Child) {
    kill(&mut child);
    if let Err(e) = child.wait() {
        warn!(pid = child.id(), error = %e, "failed to reap abandoned QEMU");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_cell_is_shared_between_clones() {
        let cell = StatusCell::default();
        let view = cell.clone();
        assert_eq!(view.get().state, ProcessState::NotStarted);

        cell.set(Status {
            state: ProcessState::Running,
            pid: Some(12),
            exit_code: None,
        });
        assert_eq!(view.get().pid, Some(12));
    }

    #[test]
    fn controller_without_child_has_nothing_to_stop() {
        let mut controller = LifecycleController::new(
            "qemu-system-x86_64",
            StatusCell::default(),
            InputSlot::new(crate::bridge::Channel::Stdin),
            InputSlot::new(crate::bridge::Channel::Console),
        );
        assert_eq!(controller.stop(), None);
        assert_eq!(controller.terminate(), None);
        assert_eq!(controller.poll_exit(), None);
    }

    #[test]
    fn state_names() {
        assert_eq!(ProcessState::NotStarted.to_string(), "not started");
        assert_eq!(ProcessState::Exited.to_string(), "exited");
    }
}
