//! Shared registry of available and running VMs.
//!
//! All mutation goes through one async mutex. The simple operations lock it
//! themselves; [`Registry::lock`] hands out the guard for check-then-act
//! sequences that must be atomic relative to other requests.

use crate::instance::VirtualMachineInstance;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;
use velocity_core::{Error, Result, VirtualMachine, VmProperties};

/// Thread-safe registry of VM definitions and running instances.
#[derive(Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().await
    }

    pub async fn lookup_running(&self, name: &str) -> Option<VirtualMachine> {
        self.lock()
            .await
            .lookup_running(name)
            .map(VirtualMachineInstance::virtual_machine)
    }

    pub async fn insert_running(&self, instance: VirtualMachineInstance) -> Result<()> {
        self.lock().await.insert_running(instance)
    }

    pub async fn remove_running(&self, name: &str) -> Option<VirtualMachineInstance> {
        self.lock().await.remove_running(name)
    }

    pub async fn register_available(&self, properties: VmProperties) -> Result<()> {
        self.lock().await.register_available(properties)
    }
}

/// Registry contents, accessed through the [`Registry`] lock.
#[derive(Default)]
pub struct RegistryState {
    available: HashMap<String, Arc<VmProperties>>,
    /// In start order.
    running: Vec<VirtualMachineInstance>,
    /// Names whose start was accepted but whose instance is not inserted yet.
    starting: HashSet<String>,
}

impl RegistryState {
    pub fn lookup_running(&self, name: &str) -> Option<&VirtualMachineInstance> {
        self.running.iter().find(|vm| vm.name() == name)
    }

    pub fn lookup_running_mut(&mut self, name: &str) -> Option<&mut VirtualMachineInstance> {
        self.running.iter_mut().find(|vm| vm.name() == name)
    }

    pub(crate) fn running_by_id_mut(&mut self, id: Uuid) -> Option<&mut VirtualMachineInstance> {
        self.running.iter_mut().find(|vm| vm.id() == id)
    }

    /// Appends a running instance. At most one instance per name may run.
    pub fn insert_running(&mut self, instance: VirtualMachineInstance) -> Result<()> {
        if self.lookup_running(instance.name()).is_some() {
            return Err(Error::DuplicateName(instance.name().to_string()));
        }
        self.running.push(instance);
        Ok(())
    }

    /// Removes the instance running under `name`, if any.
    pub fn remove_running(&mut self, name: &str) -> Option<VirtualMachineInstance> {
        let index = self.running.iter().position(|vm| vm.name() == name)?;
        Some(self.running.remove(index))
    }

    /// Removes a specific instance. A no-op if it was already removed, even
    /// when a newer instance runs under the same name.
    pub(crate) fn remove_running_by_id(&mut self, id: Uuid) -> Option<VirtualMachineInstance> {
        let index = self.running.iter().position(|vm| vm.id() == id)?;
        Some(self.running.remove(index))
    }

    pub fn register_available(&mut self, properties: VmProperties) -> Result<()> {
        if self.available.contains_key(&properties.name) {
            return Err(Error::DuplicateName(properties.name));
        }
        self.available
            .insert(properties.name.clone(), Arc::new(properties));
        Ok(())
    }

    /// Replaces the whole catalog. Leaves it untouched if `definitions`
    /// contains a duplicate name.
    pub fn replace_available(&mut self, definitions: Vec<VmProperties>) -> Result<()> {
        let mut available = HashMap::with_capacity(definitions.len());
        for properties in definitions {
            if available.contains_key(&properties.name) {
                return Err(Error::DuplicateName(properties.name));
            }
            available.insert(properties.name.clone(), Arc::new(properties));
        }
        self.available = available;
        Ok(())
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.available.contains_key(name)
    }

    pub fn available(&self, name: &str) -> Option<Arc<VmProperties>> {
        self.available.get(name).cloned()
    }

    /// All definitions, sorted by name.
    pub fn available_vms(&self) -> Vec<VmProperties> {
        let mut vms: Vec<VmProperties> =
            self.available.values().map(|p| (**p).clone()).collect();
        vms.sort_by(|a, b| a.name.cmp(&b.name));
        vms
    }

    /// Status of every running instance, in start order.
    pub fn running_vms(&self) -> Vec<VirtualMachine> {
        self.running
            .iter()
            .map(VirtualMachineInstance::virtual_machine)
            .collect()
    }

    pub fn is_starting(&self, name: &str) -> bool {
        self.starting.contains(name)
    }

    /// Claims `name` for a pending start. Returns `false` if it is already
    /// running or starting.
    pub(crate) fn reserve_start(&mut self, name: &str) -> bool {
        if self.lookup_running(name).is_some() {
            return false;
        }
        self.starting.insert(name.to_string())
    }

    pub(crate) fn release_start(&mut self, name: &str) -> bool {
        self.starting.remove(name)
    }
}
