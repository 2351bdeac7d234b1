//! Lifecycle controller.
//!
//! [`Manager`] validates every request against the registry under its lock
//! and rejects precondition violations before anything is delegated to the
//! engine. Accepted starts and stops continue on background tasks; their
//! outcome is delivered through [`PendingStart`] and [`PendingStop`].
//!
//! # Lifecycle
//!
//! ```text
//! start ──► Running ──stop──► ShuttingDown ──engine exit──► Stopped
//!              │                    │
//!              │                    └──timeout / failed request──► Aborted
//!              └──engine error (either state)──────────────────► Crashed
//! ```
//!
//! An instance leaves the registry only when its exit has been observed,
//! and its engine and display handles are released at that point. An
//! aborted instance stays registered as `Aborted` until its engine dies.

use crate::config::ManagerConfig;
use crate::display::{DisplayContext, DisplayView, encode_png};
use crate::instance::VirtualMachineInstance;
use crate::registry::{Registry, RegistryState};
use crate::store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use velocity_core::{
    EngineConfig, EngineHandle, Error, HypervisorEngine, Result, StopReason, VirtualMachine,
    VmProperties, VmState,
};

/// How long [`Manager::press_key`] holds a key down.
const KEY_PRESS_DURATION: Duration = Duration::from_millis(100);

/// Owns the registry and sequences lifecycle requests against the engine
/// and display context.
///
/// Cloning is cheap; clones share the same registry.
///
/// ```rust,no_run
/// use velocity::{DisplayContext, Manager, ManagerConfig, Registry, select_engine};
/// use std::sync::Arc;
///
/// # async fn example() -> velocity::Result<()> {
/// let manager = Manager::new(
///     ManagerConfig::default().with_bundle_dir("/var/lib/velocity"),
///     Registry::new(),
///     Arc::from(select_engine()?),
///     DisplayContext::headless()?,
/// )?;
///
/// manager.index().await?;
/// let vm = manager.start("alpha").await?.wait().await?;
/// println!("{} is {:?}", vm.name(), vm.vm_state);
///
/// let state = manager.stop("alpha").await?.wait().await?;
/// println!("alpha ended as {state:?}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Manager {
    registry: Arc<Registry>,
    engine: Arc<dyn HypervisorEngine>,
    display: DisplayContext,
    config: ManagerConfig,
}

impl Manager {
    pub fn new(
        config: ManagerConfig,
        registry: Registry,
        engine: Arc<dyn HypervisorEngine>,
        display: DisplayContext,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry: Arc::new(registry),
            engine,
            display,
            config,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Rebuilds the catalog of available VMs from the bundle directory.
    ///
    /// The registry stays locked for the whole scan. On failure the previous
    /// catalog is kept as is. Returns the number of definitions found.
    pub async fn index(&self) -> Result<usize> {
        let mut state = self.registry.lock().await;
        let bundle_dir = self.config.bundle_dir.clone();
        let definitions = tokio::task::spawn_blocking(move || store::index(&bundle_dir))
            .await
            .map_err(|e| Error::Index {
                path: self.config.bundle_dir.clone(),
                reason: e.to_string(),
            })??;
        let count = definitions.len();
        state.replace_available(definitions)?;

        info!(bundle_dir = %self.config.bundle_dir.display(), count, "indexed VM bundles");
        Ok(count)
    }

    /// Deploys a new bundle and registers its definition.
    ///
    /// Nothing is registered if deployment fails.
    pub async fn create(&self, properties: VmProperties) -> Result<VirtualMachine> {
        let mut state = self.registry.lock().await;
        if state.is_available(&properties.name) {
            return Err(Error::DuplicateName(properties.name));
        }

        let bundle_dir = self.config.bundle_dir.clone();
        let definition = properties.clone();
        let bundle = tokio::task::spawn_blocking(move || store::deploy(&bundle_dir, &definition))
            .await
            .map_err(|e| Error::Deploy {
                name: properties.name.clone(),
                reason: e.to_string(),
            })??;
        let vm = VirtualMachine::new(VmState::Stopped, properties.clone());
        state.register_available(properties)?;

        info!(vm = %vm.name(), bundle = %bundle.display(), "VM created");
        Ok(vm)
    }

    /// Accepts a start request for an available VM.
    ///
    /// Fails immediately with [`Error::AlreadyRunning`] if the VM is running,
    /// stopping, or has a start in flight. Otherwise the engine is
    /// instantiated in the background.
    pub async fn start(&self, name: &str) -> Result<PendingStart> {
        let properties = {
            let mut state = self.registry.lock().await;
            let properties = state
                .available(name)
                .ok_or_else(|| Error::UnknownVm(name.to_string()))?;
            if !state.reserve_start(name) {
                return Err(Error::AlreadyRunning(name.to_string()));
            }
            properties
        };

        let mut reservation = StartReservation::new(Arc::clone(&self.registry), name);
        let (reply, rx) = oneshot::channel();
        let manager = self.clone();

        tokio::spawn(async move {
            let name = properties.name.clone();
            let result = manager.launch(properties, &mut reservation).await;
            if let Err(e) = &result {
                reservation.settle(&mut *manager.registry.lock().await);
                error!(vm = %name, error = %e, "failed to start VM");
            }
            let _ = reply.send(result);
        });

        debug!(vm = %name, "start accepted");
        Ok(PendingStart {
            name: name.to_string(),
            rx,
        })
    }

    async fn launch(
        &self,
        properties: Arc<VmProperties>,
        reservation: &mut StartReservation,
    ) -> Result<VirtualMachine> {
        let name = properties.name.clone();
        let config = EngineConfig::new(
            Arc::clone(&properties),
            store::bundle_path(&self.config.bundle_dir, &name),
        );

        let engine: Arc<dyn EngineHandle> = Arc::from(self.engine.instantiate(&config).await?);

        let display = match self.display.allocate(properties.screen_size).await {
            Ok(display) => display,
            Err(e) => {
                terminate(&name, engine.as_ref()).await;
                return Err(e);
            }
        };

        let mut instance = VirtualMachineInstance::new(properties, Arc::clone(&engine), display);
        instance.transition(VmState::Running)?;
        let id = instance.id();
        let vm = instance.virtual_machine();

        {
            let mut state = self.registry.lock().await;
            if let Err(e) = state.insert_running(instance) {
                drop(state);
                terminate(&name, engine.as_ref()).await;
                return Err(e);
            }
            reservation.settle(&mut state);
        }

        tokio::spawn(self.clone().watch_exit(id, name.clone(), engine));

        info!(vm = %name, engine = self.engine.name(), "VM started");
        Ok(vm)
    }

    /// Awaits the engine's stop/crash callback for one instance and commits
    /// the resulting transition.
    async fn watch_exit(self, id: Uuid, name: String, engine: Arc<dyn EngineHandle>) {
        let reason = engine
            .wait()
            .await
            .unwrap_or_else(|e| StopReason::Error(e.to_string()));
        drop(engine);

        let mut state = self.registry.lock().await;
        let Some(instance) = state.running_by_id_mut(id) else {
            debug!(vm = %name, "exit observed after teardown");
            return;
        };

        // An abort already committed the final state.
        let aborted = instance.current_state() == VmState::Aborted;
        if !aborted {
            let to = match &reason {
                StopReason::GuestStopped => VmState::Stopped,
                StopReason::Error(_) => VmState::Crashed,
            };
            if let Err(e) = instance.transition(to) {
                warn!(vm = %name, error = %e, "unexpected exit transition");
            }
        }

        if let Some(mut instance) = state.remove_running_by_id(id) {
            instance.release_handles();
        }
        drop(state);

        match reason {
            _ if aborted => warn!(vm = %name, "VM aborted"),
            StopReason::GuestStopped => info!(vm = %name, "VM stopped"),
            StopReason::Error(message) => error!(vm = %name, error = %message, "VM crashed"),
        }
    }

    /// Accepts a stop request for a running VM.
    ///
    /// The instance is moved to `ShuttingDown` before this returns, so any
    /// further `stop` or `start` for the same name is rejected until the
    /// engine reports the exit.
    pub async fn stop(&self, name: &str) -> Result<PendingStop> {
        let (id, engine) = {
            let state = self.registry.lock().await;
            let instance = state
                .lookup_running(name)
                .ok_or_else(|| Error::NotRunning(name.to_string()))?;
            ensure_stoppable(name, instance.current_state())?;

            let engine = instance
                .engine()
                .ok_or_else(|| Error::NotRunning(name.to_string()))?;
            (instance.id(), engine)
        };

        // The engine is queried without the lock; the state is checked again
        // once it is retaken.
        if !engine.can_request_stop().await {
            return Err(Error::CannotStop(name.to_string()));
        }

        let rx = {
            let mut state = self.registry.lock().await;
            let instance = state
                .running_by_id_mut(id)
                .ok_or_else(|| Error::NotRunning(name.to_string()))?;
            ensure_stoppable(name, instance.current_state())?;

            instance.transition(VmState::ShuttingDown)?;
            instance.subscribe()
        };

        let (reply, pending) = oneshot::channel();
        let manager = self.clone();
        let vm = name.to_string();

        tokio::spawn(async move {
            let result = manager.drive_stop(id, &vm, engine, rx).await;
            let _ = reply.send(result);
        });

        info!(vm = %name, "stopping VM");
        Ok(PendingStop {
            name: name.to_string(),
            rx: pending,
        })
    }

    async fn drive_stop(
        &self,
        id: Uuid,
        name: &str,
        engine: Arc<dyn EngineHandle>,
        mut rx: watch::Receiver<VmState>,
    ) -> Result<VmState> {
        if let Err(e) = engine.request_stop().await {
            error!(vm = %name, error = %e, "stop request failed, terminating VM");
            if !self.abort(id, name, engine.as_ref()).await {
                return Ok(*rx.borrow());
            }
            return Err(e);
        }

        let timeout = self.config.stop_timeout();
        let outcome = tokio::time::timeout(timeout, rx.wait_for(|state| state.is_terminal()))
            .await
            .map(|result| result.map(|state| *state));

        match outcome {
            Ok(Ok(state)) => Ok(state),
            // The instance was torn down without publishing a terminal state.
            Ok(Err(_)) => Ok(*rx.borrow()),
            Err(_) => {
                warn!(vm = %name, ?timeout, "VM did not stop in time, terminating");
                if !self.abort(id, name, engine.as_ref()).await {
                    return Ok(*rx.borrow());
                }
                Err(Error::StopTimeout {
                    name: name.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Resolves with the state a running VM ends in, however it stops.
    pub async fn wait_for_exit(&self, name: &str) -> Result<VmState> {
        let mut rx = {
            let state = self.registry.lock().await;
            state
                .lookup_running(name)
                .map(VirtualMachineInstance::subscribe)
                .ok_or_else(|| Error::NotRunning(name.to_string()))?
        };

        let outcome = rx
            .wait_for(|state| state.is_terminal())
            .await
            .map(|state| *state);
        Ok(outcome.unwrap_or_else(|_| *rx.borrow()))
    }

    /// Marks the instance `Aborted`, force-stops the engine and waits for the
    /// exit watcher to remove it.
    ///
    /// The instance keeps its name reserved until the engine is dead. Returns
    /// `false` without touching the engine if the exit was already committed.
    async fn abort(&self, id: Uuid, name: &str, engine: &dyn EngineHandle) -> bool {
        let mut rx = {
            let mut state = self.registry.lock().await;
            let Some(instance) = state.running_by_id_mut(id) else {
                debug!(vm = %name, "exit committed before abort");
                return false;
            };
            if let Err(e) = instance.transition(VmState::Aborted) {
                warn!(vm = %name, error = %e, "unexpected abort transition");
            }
            instance.subscribe()
        };

        terminate(name, engine).await;

        // The state channel closes when the exit watcher drops the instance.
        let teardown = async { while rx.changed().await.is_ok() {} };
        if tokio::time::timeout(self.config.stop_timeout(), teardown)
            .await
            .is_err()
        {
            error!(vm = %name, "engine did not exit after termination, dropping instance");
            let removed = self.registry.lock().await.remove_running_by_id(id);
            if let Some(mut instance) = removed {
                instance.release_handles();
            }
        }
        true
    }

    /// Encodes the VM's current frame as PNG.
    ///
    /// Returns `None` if the display has not rendered a frame yet.
    pub async fn snapshot(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let view = self.display_view(name).await?;
        match view.current_frame().await? {
            Some(frame) => encode_png(&frame).map(Some),
            None => Ok(None),
        }
    }

    /// Delivers one key event to the VM's display.
    pub async fn send_key(&self, name: &str, keycode: u16, down: bool) -> Result<()> {
        self.display_view(name).await?.send_key(keycode, down)
    }

    /// Presses and releases a key.
    pub async fn press_key(&self, name: &str, keycode: u16) -> Result<()> {
        let view = self.display_view(name).await?;
        view.send_key(keycode, true)?;
        tokio::time::sleep(KEY_PRESS_DURATION).await;
        view.send_key(keycode, false)
    }

    /// Copies the display view out so the registry lock is released before
    /// the display context is queried.
    async fn display_view(&self, name: &str) -> Result<DisplayView> {
        let state = self.registry.lock().await;
        state
            .lookup_running(name)
            .and_then(VirtualMachineInstance::display)
            .ok_or_else(|| Error::NotRunning(name.to_string()))
    }

    pub async fn lookup_running(&self, name: &str) -> Option<VirtualMachine> {
        self.registry.lookup_running(name).await
    }

    /// Live status if running, `Stopped` if only available.
    pub async fn status(&self, name: &str) -> Option<VirtualMachine> {
        let state = self.registry.lock().await;
        if let Some(instance) = state.lookup_running(name) {
            return Some(instance.virtual_machine());
        }
        state
            .available(name)
            .map(|properties| VirtualMachine::new(VmState::Stopped, (*properties).clone()))
    }

    /// Every known VM sorted by name, running ones with their live state.
    pub async fn list(&self) -> Vec<VirtualMachine> {
        let state = self.registry.lock().await;
        list_vms(&state)
    }

    pub async fn available(&self) -> Vec<VmProperties> {
        self.registry.lock().await.available_vms()
    }

    pub async fn running(&self) -> Vec<VirtualMachine> {
        self.registry.lock().await.running_vms()
    }
}

fn list_vms(state: &RegistryState) -> Vec<VirtualMachine> {
    let mut vms: Vec<VirtualMachine> = state
        .available_vms()
        .into_iter()
        .map(|properties| match state.lookup_running(&properties.name) {
            Some(instance) => instance.virtual_machine(),
            None => VirtualMachine::new(VmState::Stopped, properties),
        })
        .collect();

    // Still running after a re-index dropped its definition.
    for vm in state.running_vms() {
        if !state.is_available(vm.name()) {
            vms.push(vm);
        }
    }
    vms.sort_by(|a, b| a.name().cmp(b.name()));
    vms
}

/// `Aborted` counts as stopping: its engine is still being torn down.
fn ensure_stoppable(name: &str, state: VmState) -> Result<()> {
    match state {
        VmState::Running => Ok(()),
        VmState::ShuttingDown | VmState::Aborted => Err(Error::AlreadyStopping(name.to_string())),
        _ => Err(Error::NotRunning(name.to_string())),
    }
}

async fn terminate(name: &str, engine: &dyn EngineHandle) {
    if let Err(e) = engine.force_stop().await {
        error!(vm = %name, error = %e, "failed to terminate VM");
    }
}

/// Outcome of an accepted [`Manager::start`].
///
/// Dropping it does not cancel the start.
#[derive(Debug)]
pub struct PendingStart {
    name: String,
    rx: oneshot::Receiver<Result<VirtualMachine>>,
}

impl PendingStart {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves once the VM is running, or with the reason it failed to start.
    pub async fn wait(self) -> Result<VirtualMachine> {
        let Self { name, rx } = self;
        rx.await
            .map_err(|_| Error::StartFailed(format!("start of '{name}' was abandoned")))?
    }
}

/// Outcome of an accepted [`Manager::stop`].
///
/// Dropping it does not cancel the stop.
#[derive(Debug)]
pub struct PendingStop {
    name: String,
    rx: oneshot::Receiver<Result<VmState>>,
}

impl PendingStop {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves with the state the VM ended in, or with
    /// [`Error::StopTimeout`] if it had to be terminated.
    pub async fn wait(self) -> Result<VmState> {
        let Self { name, rx } = self;
        rx.await
            .map_err(|_| Error::Hypervisor(format!("stop of '{name}' was abandoned")))?
    }
}

/// Holds a name in the registry's starting set until the launch settles.
struct StartReservation {
    registry: Arc<Registry>,
    name: String,
    held: bool,
}

impl StartReservation {
    fn new(registry: Arc<Registry>, name: &str) -> Self {
        Self {
            registry,
            name: name.to_string(),
            held: true,
        }
    }

    fn settle(&mut self, state: &mut RegistryState) {
        if self.held {
            state.release_start(&self.name);
            self.held = false;
        }
    }
}

impl Drop for StartReservation {
    fn drop(&mut self) {
        if !self.held {
            return;
        }

        warn!(vm = %self.name, "start abandoned, releasing reservation");
        let registry = Arc::clone(&self.registry);
        let name = std::mem::take(&mut self.name);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                registry.lock().await.release_start(&name);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeDisplay, FakeEngine};
    use tempfile::TempDir;
    use velocity_core::ScreenSize;

    struct Fixture {
        _dir: TempDir,
        engine: FakeEngine,
        display: FakeDisplay,
        manager: Manager,
    }

    async fn fixture(engine: FakeEngine) -> Fixture {
        let dir = TempDir::new().unwrap();
        let display = FakeDisplay::new();
        let manager = Manager::new(
            ManagerConfig::default().with_bundle_dir(dir.path()),
            Registry::new(),
            Arc::new(engine.clone()),
            display.context().unwrap(),
        )
        .unwrap();
        manager
            .create(VmProperties::new("alpha", ScreenSize::new(64, 48)))
            .await
            .unwrap();

        Fixture {
            _dir: dir,
            engine,
            display,
            manager,
        }
    }

    #[test]
    fn zero_stop_timeout_is_rejected() {
        let result = Manager::new(
            ManagerConfig::default().with_stop_timeout(Duration::ZERO),
            Registry::new(),
            Arc::new(FakeEngine::new()),
            DisplayContext::headless().unwrap(),
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn start_of_unknown_vm_fails() {
        let f = fixture(FakeEngine::new()).await;
        let err = f.manager.start("ghost").await.unwrap_err();
        assert!(matches!(err, Error::UnknownVm(name) if name == "ghost"));
        assert_eq!(f.engine.instantiations(), 0);
    }

    #[tokio::test]
    async fn failed_start_releases_reservation() {
        let f = fixture(FakeEngine::new()).await;
        f.engine.fail_instantiate("alpha");

        let err = f.manager.start("alpha").await.unwrap().wait().await.unwrap_err();
        assert!(matches!(err, Error::StartFailed(_)));
        assert!(f.manager.lookup_running("alpha").await.is_none());

        let state = f.manager.registry.lock().await;
        assert!(!state.is_starting("alpha"));
    }

    #[tokio::test]
    async fn status_reports_available_vm_as_stopped() {
        let f = fixture(FakeEngine::new()).await;

        let vm = f.manager.status("alpha").await.unwrap();
        assert_eq!(vm.vm_state, VmState::Stopped);
        assert!(f.manager.status("ghost").await.is_none());
    }

    #[tokio::test]
    async fn crash_removes_instance_and_releases_display() {
        let f = fixture(FakeEngine::new()).await;
        f.manager.start("alpha").await.unwrap().wait().await.unwrap();

        f.engine.vm("alpha").unwrap().crash("guest panic");

        for _ in 0..100 {
            if f.manager.lookup_running("alpha").await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.manager.lookup_running("alpha").await.is_none());
        assert_eq!(f.display.allocated(), 1);
        for _ in 0..100 {
            if f.display.released() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.display.released(), 1);
    }

    #[tokio::test]
    async fn list_merges_running_state() {
        let f = fixture(FakeEngine::new()).await;
        f.manager
            .create(VmProperties::new("beta", ScreenSize::new(64, 48)))
            .await
            .unwrap();
        f.manager.start("beta").await.unwrap().wait().await.unwrap();

        let states: Vec<_> = f
            .manager
            .list()
            .await
            .into_iter()
            .map(|vm| (vm.vm_info.name, vm.vm_state))
            .collect();
        assert_eq!(
            states,
            vec![
                ("alpha".to_string(), VmState::Stopped),
                ("beta".to_string(), VmState::Running),
            ]
        );
    }
}
