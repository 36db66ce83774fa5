//! Emulator process lifecycle state machine.
//!
//! Hierarchy:
//! ```text
//! NotStarted ──Spawned──► Alive (superstate) ──Reaped──► Exited { code }
//!                            ├── Running { pid }
//!                            └── Stopping { pid }
//! Exited ──Spawned──► Running   (fresh start only)
//! ```
//!
//! Events that make no sense in the current state are absorbed; the
//! controller checks preconditions before dispatching.

use statig::prelude::*;
use tracing::{debug, info};

use crate::lifecycle::ProcessState;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events dispatched by the lifecycle controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The child was spawned and attached to the console.
    Spawned { pid: u32 },
    /// A graceful or forced stop has been requested.
    StopRequested,
    /// The child was reaped with this exit code.
    Reaped { code: i32 },
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

/// Storage for the lifecycle machine. Only the emulator name, for logs.
#[derive(Debug, Default)]
pub struct LifecycleMachine {
    pub system: String,
}

impl LifecycleMachine {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
        }
    }

    /// Public snapshot of a machine state.
    pub fn process_state(state: &State) -> ProcessState {
        match state {
            State::NotStarted {} => ProcessState::NotStarted,
            State::Running { .. } => ProcessState::Running,
            State::Stopping { .. } => ProcessState::Stopping,
            State::Exited { .. } => ProcessState::Exited,
        }
    }

    /// Pid of the live child, if any.
    pub fn pid(state: &State) -> Option<u32> {
        match state {
            State::Running { pid } | State::Stopping { pid } => Some(*pid),
            _ => None,
        }
    }

    /// Exit code of the most recently reaped child.
    pub fn exit_code(state: &State) -> Option<i32> {
        match state {
            State::Exited { code } => Some(*code),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::not_started()",
    state(derive(Debug, Clone, PartialEq))
)]
impl LifecycleMachine {
    // ------------------------------------------------------------------
    // Superstate: Alive (parent of Running and Stopping)
    // ------------------------------------------------------------------

    #[superstate]
    fn alive(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Reaped { code } => {
                info!(system = %self.system, code, "QEMU exited");
                Transition(State::exited(*code))
            }
            _ => Handled,
        }
    }

    // ------------------------------------------------------------------
    // Leaf states
    // ------------------------------------------------------------------

    /// Configured but never started.
    #[state]
    fn not_started(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Spawned { pid } => Transition(State::running(*pid)),
            _ => Handled,
        }
    }

    /// Child is up and its channels are bridged.
    #[state(superstate = "alive", entry_action = "enter_running")]
    fn running(&mut self, pid: &u32, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::StopRequested => Transition(State::stopping(*pid)),
            _ => Super,
        }
    }

    /// Stop requested; waiting for the child to be reaped.
    #[state(superstate = "alive", entry_action = "enter_stopping")]
    fn stopping(&mut self, pid: &u32, event: &LifecycleEvent) -> Outcome<State> {
        let _ = (pid, event);
        Super
    }

    /// Child reaped; `code` is kept until the next start.
    #[state]
    fn exited(&mut self, code: &i32, event: &LifecycleEvent) -> Outcome<State> {
        let _ = code;
        match event {
            LifecycleEvent::Spawned { pid } => Transition(State::running(*pid)),
            _ => Handled,
        }
    }

    // ------------------------------------------------------------------
    // Entry actions
    // ------------------------------------------------------------------

    #[action]
    fn enter_running(&mut self) {
        info!(system = %self.system, "QEMU running");
    }

    #[action]
    fn enter_stopping(&mut self) {
        debug!(system = %self.system, "stopping QEMU");
    }
}
