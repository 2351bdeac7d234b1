use crate::types::VmState;
use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur when managing VMs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to index {}: {reason}", path.display())]
    Index { path: PathBuf, reason: String },

    #[error("a VM named '{0}' already exists")]
    DuplicateName(String),

    #[error("no VM named '{0}' is available")]
    UnknownVm(String),

    #[error("VM '{0}' is already running")]
    AlreadyRunning(String),

    #[error("VM '{0}' is not running")]
    NotRunning(String),

    #[error("VM '{0}' is already stopping")]
    AlreadyStopping(String),

    #[error("VM '{0}' cannot be stopped right now")]
    CannotStop(String),

    #[error("failed to deploy VM '{name}': {reason}")]
    Deploy { name: String, reason: String },

    #[error("VM '{name}' did not stop within {timeout:?} and was terminated")]
    StopTimeout { name: String, timeout: Duration },

    #[error("invalid state transition for VM '{name}': {from:?} -> {to:?}")]
    InvalidTransition {
        name: String,
        from: VmState,
        to: VmState,
    },

    #[error("VM failed to start: {0}")]
    StartFailed(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no suitable hypervisor engine available")]
    NoEngineAvailable,

    #[error("engine '{name}' is not available: {reason}")]
    EngineUnavailable { name: String, reason: String },

    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    #[error("display error: {0}")]
    Display(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
