use crate::error::Result;
use crate::types::VmProperties;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything an engine needs to boot one VM.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub properties: Arc<VmProperties>,
    /// The VM's bundle directory; relative disk paths resolve against it.
    pub bundle_path: PathBuf,
}

impl EngineConfig {
    pub fn new(properties: Arc<VmProperties>, bundle_path: impl Into<PathBuf>) -> Self {
        Self {
            properties,
            bundle_path: bundle_path.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.properties.name
    }

    pub fn bundle_path(&self) -> &Path {
        &self.bundle_path
    }

    pub fn disk_paths(&self) -> Vec<PathBuf> {
        self.properties.disk_paths(&self.bundle_path)
    }
}

/// Why a VM stopped executing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    GuestStopped,
    Error(String),
}

/// A live hypervisor session for one VM.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    /// Whether the guest can currently honor a stop request. Never changes state.
    async fn can_request_stop(&self) -> bool;
    /// Asks the guest to stop. Returns once the request has been issued;
    /// completion is observed through [`wait`](Self::wait).
    async fn request_stop(&self) -> Result<()>;
    async fn force_stop(&self) -> Result<()>;
    /// Resolves once the VM has stopped executing, for whatever reason.
    ///
    /// This is the engine's stop/crash callback. It is awaited exactly once
    /// per handle.
    async fn wait(&self) -> Result<StopReason>;
}

#[async_trait]
pub trait HypervisorEngine: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_available(&self) -> bool;
    async fn instantiate(&self, config: &EngineConfig) -> Result<Box<dyn EngineHandle>>;
}
