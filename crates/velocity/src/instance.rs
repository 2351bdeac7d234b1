//! A running realization of one VM definition.

use crate::display::{DisplayLease, DisplayView};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;
use uuid::Uuid;
use velocity_core::{EngineHandle, Error, Result, VirtualMachine, VmProperties, VmState};

/// One instantiated VM: its definition, lifecycle state and the engine and
/// display handles allocated for it.
///
/// Instances are created by [`Manager::start`](crate::Manager::start) and
/// only mutated under the registry lock. Every state change is published to
/// subscribers so waiters can observe completion without holding the lock.
pub struct VirtualMachineInstance {
    id: Uuid,
    properties: Arc<VmProperties>,
    state: VmState,
    state_tx: watch::Sender<VmState>,
    engine: Option<Arc<dyn EngineHandle>>,
    display: Option<DisplayLease>,
}

impl VirtualMachineInstance {
    pub(crate) fn new(
        properties: Arc<VmProperties>,
        engine: Arc<dyn EngineHandle>,
        display: DisplayLease,
    ) -> Self {
        let (state_tx, _) = watch::channel(VmState::Stopped);
        Self {
            id: Uuid::new_v4(),
            properties,
            state: VmState::Stopped,
            state_tx,
            engine: Some(engine),
            display: Some(display),
        }
    }

    /// Unique per start, unlike the name.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.properties.name
    }

    pub fn properties(&self) -> &VmProperties {
        &self.properties
    }

    pub fn current_state(&self) -> VmState {
        self.state
    }

    pub fn transition(&mut self, to: VmState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                name: self.name().to_string(),
                from: self.state,
                to,
            });
        }

        self.state = to;
        self.state_tx.send_replace(to);
        Ok(())
    }

    /// Asks the engine whether the guest can honor a stop request right now.
    pub async fn can_request_stop(&self) -> bool {
        match &self.engine {
            Some(engine) => engine.can_request_stop().await,
            None => false,
        }
    }

    pub fn virtual_machine(&self) -> VirtualMachine {
        VirtualMachine::new(self.state, (*self.properties).clone())
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<VmState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn engine(&self) -> Option<Arc<dyn EngineHandle>> {
        self.engine.clone()
    }

    pub(crate) fn display(&self) -> Option<DisplayView> {
        self.display.as_ref().map(DisplayLease::view)
    }

    /// Drops the engine handle and returns the display lease to the display
    /// context. Returns `false` if they were already released.
    pub(crate) fn release_handles(&mut self) -> bool {
        let engine = self.engine.take();
        let display = self.display.take();
        let released = engine.is_some() || display.is_some();
        if let Some(display) = display {
            display.release();
        }
        released
    }
}

impl Drop for VirtualMachineInstance {
    fn drop(&mut self) {
        if self.release_handles() {
            warn!(vm = %self.name(), state = ?self.state, "instance dropped without teardown");
        }
    }
}
