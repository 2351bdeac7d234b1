use super::VmProperties;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a VM instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmState {
    /// Not running. Initial state of every instance, and the final state
    /// after a clean shutdown.
    Stopped,
    /// The engine is executing the guest.
    Running,
    /// A stop request was accepted and is in flight.
    ShuttingDown,
    /// The engine reported an error and the guest is gone.
    Crashed,
    /// The guest was forcefully terminated after failing to stop in time.
    Aborted,
}

impl VmState {
    /// Whether the instance has reached the end of its lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, VmState::Stopped | VmState::Crashed | VmState::Aborted)
    }

    /// Whether `self -> to` is a legal lifecycle transition.
    pub fn can_transition_to(self, to: VmState) -> bool {
        use VmState::*;
        matches!(
            (self, to),
            (Stopped, Running)
                | (Running, ShuttingDown)
                | (Running, Stopped)
                | (ShuttingDown, Stopped)
                | (Running | ShuttingDown, Crashed)
                | (Running | ShuttingDown, Aborted)
        )
    }
}

/// Serializable view of a VM for status reporting.
///
/// This is a snapshot; the authoritative state lives on the running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub vm_state: VmState,
    pub vm_info: VmProperties,
}

impl VirtualMachine {
    pub fn new(vm_state: VmState, vm_info: VmProperties) -> Self {
        Self { vm_state, vm_info }
    }

    pub fn name(&self) -> &str {
        &self.vm_info.name
    }
}
