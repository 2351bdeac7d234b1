mod headless;
mod vfkit;

pub use headless::HeadlessDisplay;
pub use vfkit::VfkitEngine;

use velocity_core::{Error, HypervisorEngine, Result};

/// Returns the first hypervisor engine usable on this host.
pub fn select_engine() -> Result<Box<dyn HypervisorEngine>> {
    let vfkit = VfkitEngine::new();
    if vfkit.is_available() {
        return Ok(Box::new(vfkit));
    }

    Err(Error::NoEngineAvailable)
}
