pub mod display;
pub mod engine;
pub mod error;
pub mod types;

pub use display::{DisplayHandle, DisplaySurface, Frame};
pub use engine::{EngineConfig, EngineHandle, HypervisorEngine, StopReason};
pub use error::{Error, Result};
pub use types::{
    DiskImage, ImageFormat, ResourceConfig, ScreenSize, VirtualMachine, VmProperties, VmState,
};
