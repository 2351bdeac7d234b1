use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use velocity_core::{Error, Result};

const DEFAULT_STOP_TIMEOUT_SECS: u64 = 30;

/// Settings for a [`Manager`](crate::Manager).
///
/// Deserializable so it can be read straight from a TOML or JSON file;
/// missing keys fall back to the defaults.
///
/// ```rust
/// use velocity::ManagerConfig;
/// use std::time::Duration;
///
/// let config = ManagerConfig::default()
///     .with_bundle_dir("/var/lib/velocity")
///     .with_stop_timeout(Duration::from_secs(10));
/// assert_eq!(config.stop_timeout(), Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Directory whose immediate children are VM bundles.
    pub bundle_dir: PathBuf,
    /// How long a graceful stop may take before the VM is terminated.
    pub stop_timeout_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bundle_dir: PathBuf::from("bundles"),
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
        }
    }
}

impl ManagerConfig {
    pub fn with_bundle_dir(mut self, bundle_dir: impl Into<PathBuf>) -> Self {
        self.bundle_dir = bundle_dir.into();
        self
    }

    /// Sets the stop timeout, rounded up to whole seconds.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        let partial = u64::from(timeout.subsec_nanos() > 0);
        self.stop_timeout_secs = timeout.as_secs().saturating_add(partial);
        self
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stop_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "stop timeout must be at least one second".into(),
            ));
        }
        Ok(())
    }
}
