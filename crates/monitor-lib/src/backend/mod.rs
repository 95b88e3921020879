//! Fleet backend capabilities
//!
//! The monitor never talks to a cloud API directly. Everything it needs from
//! the fleet goes through [`Backend`] (inventory, catalog, volumes, lifecycle)
//! and [`RemoteExec`] (file writes on members).

mod exec;
#[cfg(any(test, feature = "mock"))]
mod memory;

pub use exec::ExecBackend;
#[cfg(any(test, feature = "mock"))]
pub use memory::{BackendCall, MemoryBackend};

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;

use crate::models::{BackendKind, InstanceType, Inventory, Volume};

pub use async_trait::async_trait;

/// Overrides applied when a member is recreated from its persistent volume
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOverrides {
    pub instance_type: Option<String>,
    pub no_dim: Option<bool>,
    pub spot: Option<bool>,
    pub owner: Option<String>,
}

/// Cloud/fleet operations used by the monitor
#[async_trait]
pub trait Backend: Send + Sync {
    /// Provider flavour, drives provider-specific comparisons
    fn kind(&self) -> BackendKind;

    /// Drop any backend-side cache so the next inventory read is fresh
    async fn force_refresh_inventory(&self) -> Result<()>;

    async fn get_inventory(&self) -> Result<Inventory>;

    /// Instance-type catalog for the monitor's region/zone
    async fn get_instance_types(&self) -> Result<Vec<InstanceType>>;

    /// Grow a volume's block device
    async fn resize_volume(&self, volume: &Volume, new_size_gb: u64, timeout: Duration)
        -> Result<()>;

    /// Force-destroy every `agi` instance named exactly `name`
    async fn destroy_member(&self, name: &str) -> Result<()>;

    async fn add_tags(&self, name: &str, tags: &HashMap<String, String>) -> Result<()>;

    /// Recreate a member by reattaching its persistent volume
    async fn start_member(&self, name: &str, overrides: &StartOverrides) -> Result<()>;
}

/// File transfer onto fleet members
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Write `contents` to `path` on the member's first node
    async fn write_file(&self, name: &str, path: &str, contents: &[u8], mode: u32) -> Result<()>;
}
