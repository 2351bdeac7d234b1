//! Scripted engine and display fakes for exercising the manager without a
//! hypervisor.
//!
//! ```rust,ignore
//! use velocity::test_utils::{FakeDisplay, FakeEngine};
//!
//! let engine = FakeEngine::new().with_manual_stop();
//! engine.refuse_stop("alpha");
//! let display = FakeDisplay::new();
//! display.set_rendering(false);
//! ```

use crate::display::DisplayContext;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use velocity_core::{
    DisplayHandle, DisplaySurface, EngineConfig, EngineHandle, Error, Frame, HypervisorEngine,
    Result, ScreenSize, StopReason,
};

/// Hypervisor engine whose VMs only stop or crash when told to.
#[derive(Clone, Default)]
pub struct FakeEngine {
    inner: Arc<FakeEngineInner>,
}

#[derive(Default)]
struct FakeEngineInner {
    instantiations: AtomicUsize,
    manual_stop: AtomicBool,
    instantiate_delay: Mutex<Option<Duration>>,
    stop_query_delay: Mutex<Option<Duration>>,
    force_stop_delay: Mutex<Option<Duration>>,
    failing: Mutex<HashSet<String>>,
    refusing_stop: Mutex<HashSet<String>>,
    vms: Mutex<HashMap<String, FakeVm>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop requests are recorded but only complete on [`FakeVm::complete_stop`].
    pub fn with_manual_stop(self) -> Self {
        self.inner.manual_stop.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_instantiate_delay(self, delay: Duration) -> Self {
        *self.inner.instantiate_delay.lock().unwrap() = Some(delay);
        self
    }

    /// `can_request_stop` takes this long to answer.
    pub fn with_stop_query_delay(self, delay: Duration) -> Self {
        *self.inner.stop_query_delay.lock().unwrap() = Some(delay);
        self
    }

    /// The engine only dies this long after `force_stop`.
    pub fn with_force_stop_delay(self, delay: Duration) -> Self {
        *self.inner.force_stop_delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn fail_instantiate(&self, name: &str) {
        self.inner.failing.lock().unwrap().insert(name.to_string());
    }

    /// VMs instantiated for `name` from now on report that they cannot stop.
    pub fn refuse_stop(&self, name: &str) {
        self.inner.refusing_stop.lock().unwrap().insert(name.to_string());
    }

    pub fn instantiations(&self) -> usize {
        self.inner.instantiations.load(Ordering::SeqCst)
    }

    /// The most recently instantiated VM for `name`.
    pub fn vm(&self, name: &str) -> Option<FakeVm> {
        self.inner.vms.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl HypervisorEngine for FakeEngine {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn instantiate(&self, config: &EngineConfig) -> Result<Box<dyn EngineHandle>> {
        self.inner.instantiations.fetch_add(1, Ordering::SeqCst);

        let delay = *self.inner.instantiate_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let name = config.name().to_string();
        if self.inner.failing.lock().unwrap().contains(&name) {
            return Err(Error::StartFailed(format!("scripted failure for '{name}'")));
        }

        let can_stop = !self.inner.refusing_stop.lock().unwrap().contains(&name);
        let auto_complete = !self.inner.manual_stop.load(Ordering::SeqCst);
        let vm = FakeVm::new(
            can_stop,
            auto_complete,
            *self.inner.stop_query_delay.lock().unwrap(),
            *self.inner.force_stop_delay.lock().unwrap(),
        );
        self.inner.vms.lock().unwrap().insert(name, vm.clone());

        Ok(Box::new(vm))
    }
}

/// Engine session for one fake VM.
#[derive(Clone)]
pub struct FakeVm {
    inner: Arc<FakeVmInner>,
}

struct FakeVmInner {
    can_stop: AtomicBool,
    auto_complete: bool,
    stop_query_delay: Option<Duration>,
    force_stop_delay: Option<Duration>,
    failing_stop: AtomicBool,
    exits_on_stop: AtomicBool,
    stop_requests: AtomicUsize,
    force_stops: AtomicUsize,
    exit: watch::Sender<Option<StopReason>>,
}

impl FakeVm {
    fn new(
        can_stop: bool,
        auto_complete: bool,
        stop_query_delay: Option<Duration>,
        force_stop_delay: Option<Duration>,
    ) -> Self {
        let (exit, _) = watch::channel(None);
        Self {
            inner: Arc::new(FakeVmInner {
                can_stop: AtomicBool::new(can_stop),
                auto_complete,
                stop_query_delay,
                force_stop_delay,
                failing_stop: AtomicBool::new(false),
                exits_on_stop: AtomicBool::new(false),
                stop_requests: AtomicUsize::new(0),
                force_stops: AtomicUsize::new(0),
                exit,
            }),
        }
    }

    pub fn set_can_stop(&self, can_stop: bool) {
        self.inner.can_stop.store(can_stop, Ordering::SeqCst);
    }

    /// Stop requests fail with a hypervisor error.
    pub fn fail_stop_request(&self) {
        self.inner.failing_stop.store(true, Ordering::SeqCst);
    }

    /// The guest powers off as the stop request is sent, and the request
    /// then fails as if the process had already gone away.
    pub fn exit_during_stop_request(&self) {
        self.inner.exits_on_stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requests(&self) -> usize {
        self.inner.stop_requests.load(Ordering::SeqCst)
    }

    pub fn force_stops(&self) -> usize {
        self.inner.force_stops.load(Ordering::SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        self.inner.exit.borrow().is_some()
    }

    /// Fires the engine's stop-completion callback.
    pub fn complete_stop(&self) {
        self.exit(StopReason::GuestStopped);
    }

    /// Fires the engine's crash callback.
    pub fn crash(&self, message: &str) {
        self.exit(StopReason::Error(message.to_string()));
    }

    fn exit(&self, reason: StopReason) {
        self.inner.exit.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }
}

#[async_trait]
impl EngineHandle for FakeVm {
    async fn can_request_stop(&self) -> bool {
        if let Some(delay) = self.inner.stop_query_delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.can_stop.load(Ordering::SeqCst) && !self.has_exited()
    }

    async fn request_stop(&self) -> Result<()> {
        self.inner.stop_requests.fetch_add(1, Ordering::SeqCst);
        if self.inner.exits_on_stop.load(Ordering::SeqCst) {
            self.complete_stop();
            // Let the exit be observed before the failure is reported.
            tokio::time::sleep(Duration::from_millis(50)).await;
            return Err(Error::Hypervisor("no such process".to_string()));
        }
        if self.inner.failing_stop.load(Ordering::SeqCst) {
            return Err(Error::Hypervisor("scripted stop failure".to_string()));
        }
        if self.inner.auto_complete {
            self.complete_stop();
        }
        Ok(())
    }

    async fn force_stop(&self) -> Result<()> {
        self.inner.force_stops.fetch_add(1, Ordering::SeqCst);
        let vm = self.clone();
        let delay = self.inner.force_stop_delay;
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            vm.exit(StopReason::Error("terminated".to_string()));
        });
        Ok(())
    }

    async fn wait(&self) -> Result<StopReason> {
        let mut rx = self.inner.exit.subscribe();
        let reason = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Hypervisor("fake VM dropped".to_string()))?
            .clone();
        reason.ok_or_else(|| Error::Hypervisor("fake VM exited without reason".to_string()))
    }
}

/// Display surface that renders a solid frame and records key events.
#[derive(Clone)]
pub struct FakeDisplay {
    inner: Arc<FakeDisplayInner>,
}

struct FakeDisplayInner {
    rendering: AtomicBool,
    allocated: AtomicUsize,
    released: AtomicUsize,
    keys: Mutex<Vec<(u16, bool)>>,
}

impl Default for FakeDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDisplay {
    pub const COLOR: [u8; 4] = [0x20, 0x40, 0x80, 0xff];

    pub fn new() -> Self {
        Self {
            inner: Arc::new(FakeDisplayInner {
                rendering: AtomicBool::new(true),
                allocated: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
                keys: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Starts a display context whose surface shares this fake's state.
    pub fn context(&self) -> Result<DisplayContext> {
        let display = self.clone();
        DisplayContext::spawn(move || display)
    }

    /// While off, handles behave as if no frame has been rendered yet.
    pub fn set_rendering(&self, rendering: bool) {
        self.inner.rendering.store(rendering, Ordering::SeqCst);
    }

    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.inner.released.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<(u16, bool)> {
        self.inner.keys.lock().unwrap().clone()
    }
}

impl DisplaySurface for FakeDisplay {
    fn allocate(&mut self, geometry: ScreenSize) -> Result<Box<dyn DisplayHandle>> {
        self.inner.allocated.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeView {
            geometry,
            display: self.clone(),
        }))
    }
}

struct FakeView {
    geometry: ScreenSize,
    display: FakeDisplay,
}

impl DisplayHandle for FakeView {
    fn current_frame(&self) -> Option<Frame> {
        self.display
            .inner
            .rendering
            .load(Ordering::SeqCst)
            .then(|| Frame::solid(self.geometry, FakeDisplay::COLOR))
    }

    fn send_key(&mut self, keycode: u16, down: bool) {
        self.display.inner.keys.lock().unwrap().push((keycode, down));
    }
}

impl Drop for FakeView {
    fn drop(&mut self) {
        self.display.inner.released.fetch_add(1, Ordering::SeqCst);
    }
}
