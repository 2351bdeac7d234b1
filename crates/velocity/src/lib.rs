//! Lifecycle manager for locally defined virtual machines.
//!
//! Velocity discovers VM bundles on disk, keeps a registry of which VMs are
//! available and which are running, and sequences start, stop and snapshot
//! requests against a hypervisor engine and a display surface.
//!
//! # Quick Start
//!
//! All interaction goes through a [`Manager`]:
//!
//! ```rust,no_run
//! use velocity::{
//!     DisplayContext, Manager, ManagerConfig, Registry, ScreenSize, VmProperties, select_engine,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> velocity::Result<()> {
//! let manager = Manager::new(
//!     ManagerConfig::default().with_bundle_dir("./bundles"),
//!     Registry::new(),
//!     Arc::from(select_engine()?),
//!     DisplayContext::headless()?,
//! )?;
//!
//! manager.index().await?;
//! manager
//!     .create(
//!         VmProperties::new("alpha", ScreenSize::new(1280, 800))
//!             .with_resources(2, 2048)
//!             .with_disk("disk.raw"),
//!     )
//!     .await?;
//!
//! manager.start("alpha").await?.wait().await?;
//! if let Some(png) = manager.snapshot("alpha").await? {
//!     std::fs::write("alpha.png", png)?;
//! }
//! manager.stop("alpha").await?.wait().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Bundles
//!
//! A bundle is a directory under [`ManagerConfig::bundle_dir`] holding a
//! `Velocity.json` definition and, usually, the VM's disk images. Directories
//! without a definition are ignored by [`Manager::index`].

mod backend;
mod config;
mod display;
mod instance;
mod manager;
mod registry;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use backend::{HeadlessDisplay, VfkitEngine, select_engine};
pub use config::ManagerConfig;
pub use display::{DisplayContext, encode_png};
pub use instance::VirtualMachineInstance;
pub use manager::{Manager, PendingStart, PendingStop};
pub use registry::{Registry, RegistryState};

pub use velocity_core::{
    DiskImage, ImageFormat, ResourceConfig, ScreenSize, VirtualMachine, VmProperties, VmState,
};

// Errors
pub use velocity_core::{Error, Result};

/// Capabilities consumed by the manager, for implementing custom engines
/// and display surfaces.
pub mod capabilities {
    pub use velocity_core::{
        DisplayHandle, DisplaySurface, EngineConfig, EngineHandle, Frame, HypervisorEngine,
        StopReason,
    };
}
