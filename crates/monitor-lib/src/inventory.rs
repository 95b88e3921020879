//! TTL-memoized view of the fleet inventory

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::debug;

use crate::backend::Backend;
use crate::models::Inventory;
use crate::observability::MonitorMetrics;

/// How long a fetched inventory is served before refetching
pub const INVENTORY_TTL: Duration = Duration::from_secs(10);

struct Cached {
    inventory: Inventory,
    expires: Instant,
}

/// Process-wide inventory cache
///
/// The lock only guards the cached snapshot; callers get their own copy.
pub struct InventoryCache {
    backend: Arc<dyn Backend>,
    cached: Mutex<Option<Cached>>,
    ttl: Duration,
    metrics: MonitorMetrics,
}

impl InventoryCache {
    pub fn new(backend: Arc<dyn Backend>, metrics: MonitorMetrics) -> Self {
        Self {
            backend,
            cached: Mutex::new(None),
            ttl: INVENTORY_TTL,
            metrics,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Return the inventory, refetching when forced or expired
    pub async fn get(&self, force_refresh: bool) -> Result<Inventory> {
        let mut cached = self.cached.lock().await;
        if !force_refresh {
            if let Some(c) = cached.as_ref().filter(|c| c.expires > Instant::now()) {
                return Ok(c.inventory.clone());
            }
        }

        let start = Instant::now();
        self.backend.force_refresh_inventory().await?;
        let inventory = self.backend.get_inventory().await?;
        self.metrics
            .observe_inventory_refresh(start.elapsed().as_secs_f64());
        debug!(
            instances = inventory.instances.len(),
            volumes = inventory.volumes.len(),
            forced = force_refresh,
            "Inventory refreshed"
        );

        *cached = Some(Cached {
            inventory: inventory.clone(),
            expires: Instant::now() + self.ttl,
        });
        Ok(inventory)
    }
}
