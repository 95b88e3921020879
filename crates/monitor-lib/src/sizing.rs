//! Sizing decisions
//!
//! Pure functions over an event, the member's current instance type and the
//! provider catalog. Nothing here talks to the network; the caller fetches
//! the catalog and acts on the decision.

use serde::Serialize;
use tracing::warn;

use crate::config::SizingConfig;
use crate::error::SizingError;
use crate::models::{BackendKind, Event, EventKind, InstanceType, GIB};

/// Extra GiB on top of the computed preprocess requirement
const PREPROCESS_HEADROOM_GB: i64 = 2;

/// Disk growth for a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiskChange {
    pub initial_gb: u64,
    pub final_gb: u64,
}

/// Instance replacement for a member
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RamChange {
    pub initial_type: String,
    pub final_type: String,
    pub disable_dim: bool,
}

/// Combined outcome for one event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SizingDecision {
    pub disk: Option<DiskChange>,
    pub ram: Option<RamChange>,
}

/// Which remediation, if any, a decision calls for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingPath {
    None,
    DiskOnly,
    RamOnly,
    DiskAndRam,
}

impl SizingDecision {
    pub fn path(&self) -> SizingPath {
        match (&self.disk, &self.ram) {
            (None, None) => SizingPath::None,
            (Some(_), None) => SizingPath::DiskOnly,
            (None, Some(_)) => SizingPath::RamOnly,
            (Some(_), Some(_)) => SizingPath::DiskAndRam,
        }
    }
}

/// The event cannot be sized; answered to the member with this status and text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizingRejection {
    pub status: u16,
    pub reason: String,
}

impl SizingRejection {
    fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    fn catalog_failure() -> Self {
        Self::new(500, "sizing: get instance types failure")
    }
}

/// Decides disk and RAM remediation from member events
#[derive(Debug, Clone)]
pub struct SizingEngine {
    config: SizingConfig,
    kind: BackendKind,
}

/// Intermediate RAM outcome before it is turned into a [`RamChange`]
#[derive(Debug, Default)]
struct RamPlan {
    new_type: Option<String>,
    disable_dim: bool,
}

impl SizingEngine {
    pub fn new(config: SizingConfig, kind: BackendKind) -> Self {
        Self { config, kind }
    }

    /// Whether deciding this event may need the instance-type catalog.
    /// Callers use this to skip the catalog fetch for quiet periodic events.
    pub fn needs_catalog(&self, event: &Event) -> bool {
        let prefer_no_dim = event.is_data_in_memory && self.config.no_dim_first;
        match event.event {
            EventKind::ServiceDown => !self.core_services_up(event) && !prefer_no_dim,
            EventKind::PreProcessComplete => true,
            _ => self.under_memory_pressure(event) && !prefer_no_dim,
        }
    }

    /// Decide disk and RAM actions for one event.
    ///
    /// `catalog` is `None` when it could not be fetched.
    pub fn decide(
        &self,
        event: &Event,
        current_type: &str,
        catalog: Option<&[InstanceType]>,
    ) -> Result<SizingDecision, SizingRejection> {
        let disk = self.check_disk(event);
        let ram = self.check_ram(event, current_type, catalog)?;
        Ok(SizingDecision { disk, ram })
    }

    /// Disk growth, GCP only
    pub fn check_disk(&self, event: &Event) -> Option<DiskChange> {
        if self.kind != BackendKind::Gcp {
            return None;
        }
        let sys = event.system();
        let total_gb = sys.disk_total_gb();
        if total_gb >= self.config.max_disk_gb
            || sys.disk_total_bytes == 0
            || sys.disk_free_bytes == 0
            || event.ingest_status.ingest.log_processor_complete_pct >= 100
        {
            return None;
        }
        let used = 1.0 - sys.disk_free_bytes as f64 / sys.disk_total_bytes as f64;
        if used <= f64::from(self.config.disk_used_pct) / 100.0 {
            return None;
        }
        let final_gb = (total_gb + self.config.disk_increase_gb).min(self.config.max_disk_gb);
        (final_gb > total_gb).then_some(DiskChange {
            initial_gb: total_gb,
            final_gb,
        })
    }

    fn core_services_up(&self, event: &Event) -> bool {
        event.ingest_status.database_running && event.ingest_status.plugin_running
    }

    fn under_memory_pressure(&self, event: &Event) -> bool {
        let sys = event.system();
        let free_gb = sys.memory_free_bytes as f64 / GIB as f64;
        let used = if sys.memory_total_bytes > 0 && sys.memory_free_bytes > 0 {
            1.0 - sys.memory_free_bytes as f64 / sys.memory_total_bytes as f64
        } else {
            0.0
        };
        free_gb < self.config.ram_min_free_gb as f64
            || used > f64::from(self.config.ram_used_pct) / 100.0
    }

    /// RAM decision; `None` when no replacement is needed
    pub fn check_ram(
        &self,
        event: &Event,
        current_type: &str,
        catalog: Option<&[InstanceType]>,
    ) -> Result<Option<RamChange>, SizingRejection> {
        let plan = match event.event {
            EventKind::ServiceDown => {
                if self.core_services_up(event) {
                    return Ok(None);
                }
                self.step_up_one(event, current_type, catalog)?
            }
            EventKind::PreProcessComplete => self.preprocess(event, current_type, catalog)?,
            _ => {
                if !self.under_memory_pressure(event) {
                    return Ok(None);
                }
                self.step_up_one(event, current_type, catalog)?
            }
        };

        let final_type = plan
            .new_type
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| current_type.to_string());
        if final_type == current_type && !plan.disable_dim {
            return Ok(None);
        }
        Ok(Some(RamChange {
            initial_type: current_type.to_string(),
            final_type,
            disable_dim: plan.disable_dim,
        }))
    }

    /// Move to the next type with more RAM than the current one
    fn step_up_one(
        &self,
        event: &Event,
        current_type: &str,
        catalog: Option<&[InstanceType]>,
    ) -> Result<RamPlan, SizingRejection> {
        let dim = event.is_data_in_memory;
        if dim && self.config.no_dim_first {
            return Ok(RamPlan {
                new_type: None,
                disable_dim: true,
            });
        }

        let current = self.current(catalog, current_type)?;
        let required = (current.memory_gib + 1.0).trunc();
        match self.size_instance_type(catalog.unwrap_or_default(), current_type, required) {
            Ok(t) => Ok(RamPlan {
                new_type: Some(t),
                disable_dim: false,
            }),
            Err(e) if !dim => Err(SizingRejection::new(400, format!("sizing: {e}"))),
            Err(e) => Ok(RamPlan {
                new_type: Some(fallback_type(&e, current_type)),
                disable_dim: true,
            }),
        }
    }

    /// Size for the log volume the ingest is about to load
    fn preprocess(
        &self,
        event: &Event,
        current_type: &str,
        catalog: Option<&[InstanceType]>,
    ) -> Result<RamPlan, SizingRejection> {
        let (dim_req, no_dim_req) = self.preprocess_requirements(event);
        let dim = event.is_data_in_memory;
        let required = if dim { dim_req } else { no_dim_req };

        let current = self.current(catalog, current_type)?;
        let catalog = catalog.unwrap_or_default();
        if current.memory_gib >= required as f64 {
            return Ok(RamPlan::default());
        }

        let mut plan = RamPlan::default();
        if dim && self.config.no_dim_first {
            plan.disable_dim = true;
            if current.memory_gib < no_dim_req as f64 {
                match self.size_instance_type(catalog, current_type, no_dim_req as f64) {
                    Ok(t) => plan.new_type = Some(t),
                    Err(e) => {
                        warn!(error = %e, current = %current_type, "Sizing without DIM could not satisfy requirement");
                        plan.new_type = Some(fallback_type(&e, current_type));
                    }
                }
            }
        } else if dim {
            match self.size_instance_type(catalog, current_type, required as f64) {
                Ok(t) => plan.new_type = Some(t),
                Err(e) => {
                    plan.new_type = Some(fallback_type(&e, current_type));
                    plan.disable_dim = true;
                }
            }
        } else {
            match self.size_instance_type(catalog, current_type, required as f64) {
                Ok(t) => plan.new_type = Some(t),
                Err(e) => {
                    let fallback = fallback_type(&e, current_type);
                    if fallback == current_type {
                        return Err(SizingRejection::new(
                            500,
                            "sizing: max reached and may still run out of memory",
                        ));
                    }
                    warn!(error = %e, new_type = %fallback, "Sizing to largest available type");
                    plan.new_type = Some(fallback);
                }
            }
        }
        Ok(plan)
    }

    /// RAM needed in GiB with and without data-in-memory
    pub fn preprocess_requirements(&self, event: &Event) -> (i64, i64) {
        let total = event.ingest_status.ingest.log_processor_total_size.max(0) as f64;
        let gib = GIB as f64;
        let base = self.config.ram_min_free_gb as i64 + PREPROCESS_HEADROOM_GB;
        let dim = (total * self.config.dim_multiplier / gib) as i64 + base;
        let no_dim = (total * self.config.no_dim_multiplier / gib) as i64 + base;
        (dim, no_dim)
    }

    fn current<'a>(
        &self,
        catalog: Option<&'a [InstanceType]>,
        current_type: &str,
    ) -> Result<&'a InstanceType, SizingRejection> {
        let catalog = catalog.ok_or_else(SizingRejection::catalog_failure)?;
        find_type(catalog, current_type).map_err(|e| {
            warn!(error = %e, "Current instance type missing from catalog");
            SizingRejection::catalog_failure()
        })
    }

    /// Smallest same-family type with at least `required_gib` of RAM.
    ///
    /// Types above the configured RAM cap are never considered. When nothing
    /// qualifies the error carries the largest candidate.
    pub fn size_instance_type(
        &self,
        catalog: &[InstanceType],
        current_type: &str,
        required_gib: f64,
    ) -> Result<String, SizingError> {
        let current_type = current_type.rsplit('/').next().unwrap_or(current_type);
        let family = instance_family(self.kind, current_type)?;

        let mut candidates: Vec<&InstanceType> = catalog
            .iter()
            .filter(|t| t.memory_gib <= self.config.max_ram_gb as f64)
            .filter(|t| t.name.starts_with(&family))
            .collect();
        if candidates.is_empty() {
            return Err(SizingError::FamilyExhausted);
        }
        candidates.sort_by(|a, b| a.memory_gib.total_cmp(&b.memory_gib));

        if let Some(t) = candidates.iter().find(|t| t.memory_gib >= required_gib) {
            return Ok(t.name.clone());
        }
        let largest = candidates
            .last()
            .map(|t| t.name.clone())
            .unwrap_or_default();
        Err(SizingError::Exhausted { largest })
    }
}

/// Family prefix of an instance type
///
/// AWS: text up to and including the first dot (`r6a.`).
/// GCP: the first two dash-separated tokens (`e2-highmem-`).
pub fn instance_family(kind: BackendKind, instance_type: &str) -> Result<String, SizingError> {
    match kind {
        BackendKind::Aws => instance_type
            .split_once('.')
            .map(|(family, _)| format!("{family}."))
            .ok_or_else(|| SizingError::FamilyNotFound(instance_type.to_string())),
        BackendKind::Gcp => {
            let parts: Vec<&str> = instance_type.split('-').collect();
            if parts.len() != 3 {
                return Err(SizingError::FamilyCannotBeSized(instance_type.to_string()));
            }
            Ok(format!("{}-{}-", parts[0], parts[1]))
        }
    }
}

/// Look up an instance type by name, accepting GCP resource paths
pub fn find_type<'a>(
    catalog: &'a [InstanceType],
    name: &str,
) -> Result<&'a InstanceType, SizingError> {
    let name = name.rsplit('/').next().unwrap_or(name);
    catalog
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| SizingError::UnknownInstanceType(name.to_string()))
}

/// Type to fall back to when stepping failed
fn fallback_type(err: &SizingError, current_type: &str) -> String {
    match err {
        SizingError::Exhausted { largest } if !largest.is_empty() => largest.clone(),
        _ => current_type.to_string(),
    }
}
