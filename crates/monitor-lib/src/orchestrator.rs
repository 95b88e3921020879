//! Remediation jobs
//!
//! All destructive work (destroy and recreate, volume growth) runs here,
//! one job at a time across the whole fleet. Jobs are started after the
//! member has been answered and report only through logs and notifications.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{Backend, RemoteExec, StartOverrides};
use crate::challenge::MemberApi;
use crate::error::OrchestrationError;
use crate::inventory::InventoryCache;
use crate::models::{Event, Inventory, MONITOR_STATE_TAG};
use crate::notify::{ActionKind, DiskSizes, Notifier, NotifyRecord, RamSizes, Stage};
use crate::observability::{MonitorMetrics, StructuredLogger};
use crate::sizing::{DiskChange, RamChange, SizingDecision};

/// Where the member's authorized keys are restored after recreation
pub const AUTHORIZED_KEYS_PATH: &str = "/root/.ssh/authorized_keys";

/// Bound on the backend volume resize call
pub const VOLUME_RESIZE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

const STATE_SIZING_CAPACITY: &str = "sizing-capacity";
const STATE_SIZING_INSTANCE: &str = "sizing-instance";

/// Everything a sizing job needs besides the decision
#[derive(Debug, Clone)]
pub struct SizingJob {
    pub event: Event,
    pub decision: SizingDecision,
    /// Secret the member presented, reused for the resize-fs call
    pub secret: String,
    /// Address the member is reachable on
    pub member_addr: String,
}

/// Collaborators the orchestrator drives
pub struct OrchestratorDeps {
    pub backend: Arc<dyn Backend>,
    pub remote: Arc<dyn RemoteExec>,
    pub members: Arc<dyn MemberApi>,
    pub inventory: Arc<InventoryCache>,
    pub notifier: Notifier,
    pub metrics: MonitorMetrics,
    pub logger: StructuredLogger,
}

/// Serializes and runs remediation jobs
pub struct Orchestrator {
    deps: OrchestratorDeps,
    exec_lock: tokio::sync::Mutex<()>,
    active: Arc<Mutex<HashSet<String>>>,
    jobs: Mutex<Vec<JoinHandle<()>>>,
}

/// Releases the member's in-flight claim when the job ends
struct Claim {
    active: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.name);
    }
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        Self {
            deps,
            exec_lock: tokio::sync::Mutex::new(()),
            active: Arc::new(Mutex::new(HashSet::new())),
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Whether a job for `name` is queued or running
    pub fn is_active(&self, name: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }

    /// Mark `name` as having a job; `None` if it already has one
    fn claim(&self, name: &str) -> Option<Claim> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(name.to_string()) {
            info!(member = %name, "Remediation already in progress, not queueing another");
            return None;
        }
        Some(Claim {
            active: Arc::clone(&self.active),
            name: name.to_string(),
        })
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.retain(|h| !h.is_finished());
        jobs.push(handle);
    }

    /// Queue a spot-capacity rotation. Returns false if the member already has a job.
    pub fn spawn_capacity(self: &Arc<Self>, event: Event) -> bool {
        let Some(claim) = self.claim(&event.agi_name) else {
            return false;
        };
        let this = Arc::clone(self);
        self.track(tokio::spawn(async move {
            let _claim = claim;
            let _ = this.rotate_capacity(&event).await;
        }));
        true
    }

    /// Queue the job for a sizing decision. Returns false if nothing was queued.
    pub fn spawn_sizing(self: &Arc<Self>, job: SizingJob) -> bool {
        if job.decision.disk.is_none() && job.decision.ram.is_none() {
            return false;
        }
        let Some(claim) = self.claim(&job.event.agi_name) else {
            return false;
        };
        let this = Arc::clone(self);
        let SizingJob {
            event,
            decision,
            secret,
            member_addr,
        } = job;
        let handle = match (decision.disk, decision.ram) {
            (Some(disk), None) => tokio::spawn(async move {
                let _claim = claim;
                let _ = this.resize_disk(&event, disk, &secret, &member_addr).await;
            }),
            (None, Some(ram)) => tokio::spawn(async move {
                let _claim = claim;
                let _ = this.resize_ram(&event, &ram).await;
            }),
            (Some(disk), Some(ram)) => tokio::spawn(async move {
                let _claim = claim;
                let _ = this
                    .resize_disk_and_ram(&event, disk, &ram, &secret, &member_addr)
                    .await;
            }),
            (None, None) => return false,
        };
        self.track(handle);
        true
    }

    /// Wait for queued and running jobs, then for their notifications
    pub async fn wait_idle(&self, timeout: Duration) {
        let handles: Vec<JoinHandle<()>> = {
            let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *jobs)
        };
        if !handles.is_empty() {
            info!(jobs = handles.len(), "Waiting for remediation jobs to finish");
        }
        let all = async {
            for h in handles {
                let _ = h.await;
            }
        };
        if tokio::time::timeout(timeout, all).await.is_err() {
            warn!("Timed out waiting for remediation jobs");
        }
        self.deps.notifier.flush(timeout).await;
    }

    /// Refuse destructive work on an unnamed member
    fn guard_name(&self, action: ActionKind, event: &Event) -> Result<(), OrchestrationError> {
        if event.agi_name.trim().is_empty() {
            self.deps
                .logger
                .log_critical(action.as_str(), "AGI name is empty, aborting");
            return Err(OrchestrationError::EmptyMemberName);
        }
        Ok(())
    }

    fn stage(&self, record: &NotifyRecord, stage: Stage, err: Option<&str>) {
        let record = record.at(stage, err);
        self.deps
            .metrics
            .inc_action(record.action.as_str(), record.stage.as_str());
        self.deps.logger.log_action_stage(
            record.action.as_str(),
            record.stage.as_str(),
            &record.name,
            err,
        );
        self.deps.notifier.notify(record);
    }

    /// Run a job body under the mutation lock, bracketed by stage notifications
    async fn run_job<F>(
        &self,
        action: ActionKind,
        record: NotifyRecord,
        body: F,
    ) -> Result<(), OrchestrationError>
    where
        F: std::future::Future<Output = Result<(), OrchestrationError>>,
    {
        let _guard = self.exec_lock.lock().await;
        debug!(action = action.as_str(), member = %record.name, "Acquired execution lock");

        self.stage(&record, Stage::Start, None);
        match body.await {
            Ok(()) => {
                self.stage(&record, Stage::Done, None);
                Ok(())
            }
            Err(e) => {
                self.stage(&record, Stage::Error, Some(&e.to_string()));
                Err(e)
            }
        }
    }

    /// Replace a spot member that lost capacity with an on-demand one
    pub async fn rotate_capacity(&self, event: &Event) -> Result<(), OrchestrationError> {
        let action = ActionKind::SpotCapacity;
        self.guard_name(action, event)?;
        let record = NotifyRecord::new(action, event);
        self.run_job(action, record, async {
            let overrides = StartOverrides {
                spot: Some(false),
                owner: owner_override(event),
                ..Default::default()
            };
            self.recreate(event, STATE_SIZING_CAPACITY, &overrides).await?;
            info!(member = %event.agi_name, "Rotated member to on-demand");
            Ok(())
        })
        .await
    }

    /// Replace a member with a larger instance type
    pub async fn resize_ram(
        &self,
        event: &Event,
        change: &RamChange,
    ) -> Result<(), OrchestrationError> {
        let action = ActionKind::SizingRam;
        self.guard_name(action, event)?;
        let mut record = NotifyRecord::new(action, event);
        record.ram = ram_sizes(change);
        self.run_job(action, record, self.ram_steps(event, change))
            .await
    }

    /// Grow a member's volume and filesystem in place
    pub async fn resize_disk(
        &self,
        event: &Event,
        change: DiskChange,
        secret: &str,
        member_addr: &str,
    ) -> Result<(), OrchestrationError> {
        let action = ActionKind::SizingDisk;
        self.guard_name(action, event)?;
        let mut record = NotifyRecord::new(action, event);
        record.disk = disk_sizes(change);
        self.run_job(
            action,
            record,
            self.disk_steps(event, change, secret, member_addr),
        )
        .await
    }

    /// Grow the volume, then replace the instance; either failure fails the job
    pub async fn resize_disk_and_ram(
        &self,
        event: &Event,
        disk: DiskChange,
        ram: &RamChange,
        secret: &str,
        member_addr: &str,
    ) -> Result<(), OrchestrationError> {
        let action = ActionKind::SizingDiskRam;
        self.guard_name(action, event)?;
        let mut record = NotifyRecord::new(action, event);
        record.disk = disk_sizes(disk);
        record.ram = ram_sizes(ram);
        self.run_job(action, record, async {
            let disk_result = self.disk_steps(event, disk, secret, member_addr).await;
            let ram_result = self.ram_steps(event, ram).await;
            match (disk_result, ram_result) {
                (Ok(()), Ok(())) => Ok(()),
                (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
                (Err(d), Err(r)) => Err(OrchestrationError::Combined {
                    disk: d.to_string(),
                    ram: r.to_string(),
                }),
            }
        })
        .await
    }

    async fn ram_steps(&self, event: &Event, change: &RamChange) -> Result<(), OrchestrationError> {
        let overrides = StartOverrides {
            instance_type: Some(change.final_type.clone()),
            no_dim: change.disable_dim.then_some(true),
            owner: owner_override(event),
            ..Default::default()
        };
        self.recreate(event, STATE_SIZING_INSTANCE, &overrides)
            .await?;
        info!(
            member = %event.agi_name,
            from = %change.initial_type,
            to = %change.final_type,
            disable_dim = change.disable_dim,
            "Rotated to instance type"
        );
        Ok(())
    }

    async fn disk_steps(
        &self,
        event: &Event,
        change: DiskChange,
        secret: &str,
        member_addr: &str,
    ) -> Result<(), OrchestrationError> {
        let deployment = event.deployment()?;
        let volume_name = if deployment.cluster_name.is_empty() {
            event.agi_name.clone()
        } else {
            deployment.cluster_name
        };

        let inventory = self.fresh_inventory().await?;
        let volume = inventory
            .volumes_named(&volume_name)
            .next()
            .cloned()
            .ok_or_else(|| OrchestrationError::VolumeNotFound(volume_name.clone()))?;

        self.deps
            .backend
            .resize_volume(&volume, change.final_gb, VOLUME_RESIZE_TIMEOUT)
            .await
            .map_err(|e| OrchestrationError::backend("volume resize", e))?;
        info!(volume = %volume_name, from_gb = change.initial_gb, to_gb = change.final_gb, "Volume resized");

        let output = self
            .deps
            .members
            .resize_fs(member_addr, secret)
            .await
            .map_err(OrchestrationError::ResizeFs)?;
        info!(member = %event.agi_name, output = %output.trim(), "Filesystem resized");
        Ok(())
    }

    /// Tag, destroy and recreate a member, then restore its keys
    async fn recreate(
        &self,
        event: &Event,
        state: &str,
        overrides: &StartOverrides,
    ) -> Result<(), OrchestrationError> {
        let name = event.agi_name.as_str();
        if name.is_empty() {
            return Err(OrchestrationError::EmptyMemberName);
        }

        let inventory = self.fresh_inventory().await?;
        self.tag_state(&inventory, name, state).await;

        self.deps
            .backend
            .destroy_member(name)
            .await
            .map_err(|e| OrchestrationError::backend("destroy", e))?;

        self.fresh_inventory().await?;
        self.deps
            .backend
            .start_member(name, overrides)
            .await
            .map_err(|e| OrchestrationError::backend("start", e))?;

        self.restore_keys(event).await;
        Ok(())
    }

    async fn fresh_inventory(&self) -> Result<Inventory, OrchestrationError> {
        self.deps
            .inventory
            .get(true)
            .await
            .map_err(|e| OrchestrationError::backend("inventory refresh", e))
    }

    async fn tag_state(&self, inventory: &Inventory, name: &str, state: &str) {
        if inventory.members_named(name).next().is_none() {
            warn!(member = %name, "Member not in inventory, skipping state tag");
            return;
        }
        let tags = HashMap::from([(MONITOR_STATE_TAG.to_string(), state.to_string())]);
        if let Err(e) = self.deps.backend.add_tags(name, &tags).await {
            warn!(member = %name, state = %state, error = %e, "Failed to tag member");
        }
    }

    async fn restore_keys(&self, event: &Event) {
        let keys = match event.authorized_keys() {
            Ok(Some(keys)) => keys,
            Ok(None) => {
                debug!(member = %event.agi_name, "No authorized keys to restore");
                return;
            }
            Err(e) => {
                warn!(member = %event.agi_name, error = %e, "Authorized keys blob invalid");
                return;
            }
        };
        if let Err(e) = self
            .deps
            .remote
            .write_file(&event.agi_name, AUTHORIZED_KEYS_PATH, &keys, 0o600)
            .await
        {
            warn!(member = %event.agi_name, error = %e, "Failed to restore authorized keys");
        }
    }
}

fn owner_override(event: &Event) -> Option<String> {
    Some(event.owner.clone()).filter(|o| !o.is_empty())
}

fn disk_sizes(change: DiskChange) -> DiskSizes {
    DiskSizes {
        initial_size_gb: change.initial_gb,
        final_size_gb: change.final_gb,
    }
}

fn ram_sizes(change: &RamChange) -> RamSizes {
    RamSizes {
        initial_instance_type: change.initial_type.clone(),
        final_instance_type: change.final_type.clone(),
        disable_dim: change.disable_dim,
    }
}
