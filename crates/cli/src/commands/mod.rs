pub mod create;
pub mod list;
pub mod run;
pub mod version;

use std::sync::Arc;
use velocity::capabilities::HypervisorEngine;
use velocity::{DisplayContext, Manager, ManagerConfig, Registry};

/// Builds a manager with a headless display and indexes the bundle directory.
async fn open_manager(
    config: ManagerConfig,
    engine: Arc<dyn HypervisorEngine>,
) -> anyhow::Result<Manager> {
    let bundle_dir = config.bundle_dir.clone();
    let manager = Manager::new(config, Registry::new(), engine, DisplayContext::headless()?)?;

    if bundle_dir.is_dir() {
        manager.index().await?;
    }
    Ok(manager)
}
