//! Display surface capability.
//!
//! Display surfaces typically wrap GUI resources that are bound to the thread
//! that created them, so neither trait requires `Send`. The manager confines
//! every surface and handle to a single display thread.

use crate::error::Result;
use crate::types::ScreenSize;

/// A rendered framebuffer, 8-bit RGBA, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Self {
        Self {
            width,
            height,
            rgba,
        }
    }

    /// A frame filled with one color.
    pub fn solid(size: ScreenSize, rgba: [u8; 4]) -> Self {
        let pixels = size.width as usize * size.height as usize;
        Self::new(size.width, size.height, rgba.repeat(pixels))
    }

    pub fn is_well_formed(&self) -> bool {
        self.rgba.len() == self.width as usize * self.height as usize * 4
    }
}

pub trait DisplaySurface {
    fn allocate(&mut self, geometry: ScreenSize) -> Result<Box<dyn DisplayHandle>>;
}

pub trait DisplayHandle {
    /// The most recently rendered frame, or `None` before the first one.
    fn current_frame(&self) -> Option<Frame>;
    fn send_key(&mut self, keycode: u16, down: bool);
}
