use tracing::trace;
use velocity_core::{DisplayHandle, DisplaySurface, Frame, Result, ScreenSize};

/// Display surface for VMs that run without a window.
///
/// Nothing is ever rendered, so snapshots come back empty, and key events
/// are dropped.
#[derive(Debug, Default)]
pub struct HeadlessDisplay;

impl HeadlessDisplay {
    pub fn new() -> Self {
        Self
    }
}

impl DisplaySurface for HeadlessDisplay {
    fn allocate(&mut self, geometry: ScreenSize) -> Result<Box<dyn DisplayHandle>> {
        Ok(Box::new(HeadlessView { geometry }))
    }
}

struct HeadlessView {
    geometry: ScreenSize,
}

impl DisplayHandle for HeadlessView {
    fn current_frame(&self) -> Option<Frame> {
        None
    }

    fn send_key(&mut self, keycode: u16, down: bool) {
        trace!(
            keycode,
            down,
            width = self.geometry.width,
            height = self.geometry.height,
            "dropping key event on headless display"
        );
    }
}
