//! In-memory backend for tests and offline tooling

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{Backend, RemoteExec, StartOverrides};
use crate::models::{BackendKind, Instance, InstanceType, Inventory, Volume};

/// Calls recorded by [`MemoryBackend`], in order
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    ForceRefresh,
    GetInventory,
    GetInstanceTypes,
    ResizeVolume { name: String, size_gb: u64 },
    Destroy { name: String },
    AddTags { name: String, tags: HashMap<String, String> },
    Start { name: String, overrides: StartOverrides },
    WriteFile { name: String, path: String, contents: Vec<u8> },
}

#[derive(Default)]
struct MemoryState {
    inventory: Inventory,
    destroyed: HashMap<String, Instance>,
    calls: Vec<BackendCall>,
    next_id: u64,
}

/// Backend holding the fleet in memory
///
/// Destroy removes the named members; start brings them back with a new
/// instance id and the overrides applied.
pub struct MemoryBackend {
    kind: BackendKind,
    catalog: Vec<InstanceType>,
    state: Mutex<MemoryState>,
    fail_destroy: bool,
    fail_catalog: bool,
}

impl MemoryBackend {
    pub fn new(kind: BackendKind, inventory: Inventory, catalog: Vec<InstanceType>) -> Self {
        Self {
            kind,
            catalog,
            state: Mutex::new(MemoryState {
                inventory,
                ..Default::default()
            }),
            fail_destroy: false,
            fail_catalog: false,
        }
    }

    /// Make every destroy call fail
    pub fn with_failing_destroy(mut self) -> Self {
        self.fail_destroy = true;
        self
    }

    /// Make the instance-type catalog unavailable
    pub fn with_failing_catalog(mut self) -> Self {
        self.fail_catalog = true;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: BackendCall) {
        self.lock().calls.push(call);
    }

    /// All recorded calls
    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    /// Recorded destructive calls only
    pub fn mutations(&self) -> Vec<BackendCall> {
        self.calls()
            .into_iter()
            .filter(|c| {
                !matches!(
                    c,
                    BackendCall::ForceRefresh
                        | BackendCall::GetInventory
                        | BackendCall::GetInstanceTypes
                )
            })
            .collect()
    }

    pub fn inventory(&self) -> Inventory {
        self.lock().inventory.clone()
    }

    /// Replace the stored inventory
    pub fn set_inventory(&self, inventory: Inventory) {
        self.lock().inventory = inventory;
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn force_refresh_inventory(&self) -> Result<()> {
        self.record(BackendCall::ForceRefresh);
        Ok(())
    }

    async fn get_inventory(&self) -> Result<Inventory> {
        let mut state = self.lock();
        state.calls.push(BackendCall::GetInventory);
        Ok(state.inventory.clone())
    }

    async fn get_instance_types(&self) -> Result<Vec<InstanceType>> {
        self.record(BackendCall::GetInstanceTypes);
        if self.fail_catalog {
            return Err(anyhow!("instance type catalog unavailable"));
        }
        Ok(self.catalog.clone())
    }

    async fn resize_volume(
        &self,
        volume: &Volume,
        new_size_gb: u64,
        _timeout: Duration,
    ) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(BackendCall::ResizeVolume {
            name: volume.name.clone(),
            size_gb: new_size_gb,
        });
        for v in state
            .inventory
            .volumes
            .iter_mut()
            .filter(|v| v.volume_id == volume.volume_id)
        {
            v.size_gb = new_size_gb;
        }
        Ok(())
    }

    async fn destroy_member(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(BackendCall::Destroy {
            name: name.to_string(),
        });
        if self.fail_destroy {
            return Err(anyhow!("destroy failed for {name}"));
        }
        let (gone, kept): (Vec<Instance>, Vec<Instance>) =
            std::mem::take(&mut state.inventory.instances)
                .into_iter()
                .partition(|i| i.kind == crate::models::MEMBER_KIND && i.name == name);
        state.inventory.instances = kept;
        if let Some(first) = gone.into_iter().next() {
            state.destroyed.insert(name.to_string(), first);
        }
        Ok(())
    }

    async fn add_tags(&self, name: &str, tags: &HashMap<String, String>) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(BackendCall::AddTags {
            name: name.to_string(),
            tags: tags.clone(),
        });
        for inst in state.inventory.instances.iter_mut().filter(|i| i.name == name) {
            inst.tags.extend(tags.clone());
        }
        Ok(())
    }

    async fn start_member(&self, name: &str, overrides: &StartOverrides) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(BackendCall::Start {
            name: name.to_string(),
            overrides: overrides.clone(),
        });
        let mut inst = state
            .destroyed
            .remove(name)
            .ok_or_else(|| anyhow!("no stopped member named {name}"))?;
        state.next_id += 1;
        inst.instance_id = format!("{}-r{}", inst.instance_id, state.next_id);
        if let Some(t) = &overrides.instance_type {
            inst.instance_type = t.clone();
        }
        if let Some(owner) = &overrides.owner {
            inst.owner = owner.clone();
        }
        state.inventory.instances.push(inst);
        Ok(())
    }
}

#[async_trait]
impl RemoteExec for MemoryBackend {
    async fn write_file(&self, name: &str, path: &str, contents: &[u8], _mode: u32) -> Result<()> {
        self.record(BackendCall::WriteFile {
            name: name.to_string(),
            path: path.to_string(),
            contents: contents.to_vec(),
        });
        Ok(())
    }
}
