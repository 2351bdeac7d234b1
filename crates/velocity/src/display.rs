//! Display execution context.
//!
//! All display surfaces and handles live on one dedicated thread. The rest of
//! the manager talks to them only through messages, so a display query never
//! runs under the registry lock and the two can never deadlock each other.

use crate::backend::HeadlessDisplay;
use std::collections::HashMap;
use std::io::Cursor;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use uuid::Uuid;
use velocity_core::{DisplayHandle, DisplaySurface, Error, Frame, Result, ScreenSize};

enum DisplayCommand {
    Allocate {
        id: Uuid,
        geometry: ScreenSize,
        reply: oneshot::Sender<Result<()>>,
    },
    Frame {
        id: Uuid,
        reply: oneshot::Sender<Option<Frame>>,
    },
    SendKey {
        id: Uuid,
        keycode: u16,
        down: bool,
    },
    Release {
        id: Uuid,
    },
}

/// Handle to the thread that owns every display surface.
///
/// Cloning is cheap. The thread exits once the context and every lease and
/// view allocated from it have been dropped.
#[derive(Clone)]
pub struct DisplayContext {
    tx: mpsc::UnboundedSender<DisplayCommand>,
}

impl DisplayContext {
    /// Starts the display thread. `factory` runs on that thread, so the
    /// surface it builds does not need to be `Send`.
    pub fn spawn<S, F>(factory: F) -> Result<Self>
    where
        F: FnOnce() -> S + Send + 'static,
        S: DisplaySurface + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("velocity-display".to_string())
            .spawn(move || run(factory(), rx))?;
        Ok(Self { tx })
    }

    /// A context backed by a surface that never renders.
    pub fn headless() -> Result<Self> {
        Self::spawn(HeadlessDisplay::new)
    }

    pub(crate) async fn allocate(&self, geometry: ScreenSize) -> Result<DisplayLease> {
        let id = Uuid::new_v4();
        let (reply, rx) = oneshot::channel();
        send(&self.tx, DisplayCommand::Allocate {
            id,
            geometry,
            reply,
        })?;
        rx.await.map_err(|_| context_gone())??;

        Ok(DisplayLease {
            view: DisplayView {
                id,
                tx: self.tx.clone(),
            },
        })
    }
}

/// Exclusive ownership of one allocated display handle.
///
/// Not cloneable: the handle is released exactly once, by [`release`](Self::release).
pub(crate) struct DisplayLease {
    view: DisplayView,
}

impl DisplayLease {
    pub(crate) fn view(&self) -> DisplayView {
        self.view.clone()
    }

    pub(crate) fn release(self) {
        let id = self.view.id;
        if send(&self.view.tx, DisplayCommand::Release { id }).is_err() {
            debug!(%id, "display context already gone, nothing to release");
        }
    }
}

/// Query access to a leased display handle.
#[derive(Clone)]
pub(crate) struct DisplayView {
    id: Uuid,
    tx: mpsc::UnboundedSender<DisplayCommand>,
}

impl DisplayView {
    pub(crate) async fn current_frame(&self) -> Result<Option<Frame>> {
        let (reply, rx) = oneshot::channel();
        send(&self.tx, DisplayCommand::Frame { id: self.id, reply })?;
        rx.await.map_err(|_| context_gone())
    }

    pub(crate) fn send_key(&self, keycode: u16, down: bool) -> Result<()> {
        send(&self.tx, DisplayCommand::SendKey {
            id: self.id,
            keycode,
            down,
        })
    }
}

/// Encodes an RGBA frame as PNG.
pub fn encode_png(frame: &Frame) -> Result<Vec<u8>> {
    if !frame.is_well_formed() {
        return Err(Error::Display(format!(
            "frame buffer of {} bytes does not match {}x{}",
            frame.rgba.len(),
            frame.width,
            frame.height
        )));
    }

    let mut png = Cursor::new(Vec::new());
    image::write_buffer_with_format(
        &mut png,
        &frame.rgba,
        frame.width,
        frame.height,
        image::ColorType::Rgba8,
        image::ImageFormat::Png,
    )
    .map_err(|e| Error::Display(format!("PNG encoding failed: {e}")))?;

    Ok(png.into_inner())
}

fn send(tx: &mpsc::UnboundedSender<DisplayCommand>, command: DisplayCommand) -> Result<()> {
    tx.send(command).map_err(|_| context_gone())
}

fn context_gone() -> Error {
    Error::Display("display context is not running".to_string())
}

fn run<S: DisplaySurface>(mut surface: S, mut rx: mpsc::UnboundedReceiver<DisplayCommand>) {
    let mut handles: HashMap<Uuid, Box<dyn DisplayHandle>> = HashMap::new();

    while let Some(command) = rx.blocking_recv() {
        match command {
            DisplayCommand::Allocate {
                id,
                geometry,
                reply,
            } => {
                let result = surface.allocate(geometry).map(|handle| {
                    handles.insert(id, handle);
                });
                let _ = reply.send(result);
            }
            DisplayCommand::Frame { id, reply } => {
                let frame = handles.get(&id).and_then(|h| h.current_frame());
                let _ = reply.send(frame);
            }
            DisplayCommand::SendKey { id, keycode, down } => match handles.get_mut(&id) {
                Some(handle) => {
                    trace!(%id, keycode, down, "key event");
                    handle.send_key(keycode, down);
                }
                None => warn!(%id, "key event for released display"),
            },
            DisplayCommand::Release { id } => {
                handles.remove(&id);
            }
        }
    }

    debug!("display context shutting down");
}
