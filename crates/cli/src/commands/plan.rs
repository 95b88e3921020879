//! Offline sizing dry-run

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use serde::Serialize;

use monitor_lib::{
    config::SizingConfig, BackendKind, Event, EventKind, InstanceType, SizingDecision,
    SizingEngine, SizingPath,
};

use super::read_json;
use crate::output::{
    format_gib, print_fields, print_info, print_json, print_success, print_warning, FieldRow,
    OutputFormat,
};

#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    /// Event JSON as posted by the member
    #[arg(long)]
    pub event: PathBuf,

    /// Instance-type catalog JSON (list of {name, memory_gib, cpus})
    #[arg(long)]
    pub catalog: PathBuf,

    /// Member's current instance type
    #[arg(long)]
    pub current_type: String,

    /// Backend flavour
    #[arg(long, default_value = "aws")]
    pub backend: Backend,

    /// Prefer disabling data-in-memory before resizing
    #[arg(long)]
    pub no_dim_first: bool,

    /// Largest instance RAM to consider, GiB
    #[arg(long)]
    pub max_ram_gb: Option<u64>,

    /// Largest disk to grow to, GiB
    #[arg(long)]
    pub max_disk_gb: Option<u64>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum Backend {
    Aws,
    Gcp,
}

impl From<Backend> for BackendKind {
    fn from(b: Backend) -> Self {
        match b {
            Backend::Aws => BackendKind::Aws,
            Backend::Gcp => BackendKind::Gcp,
        }
    }
}

/// What the monitor would do with the event
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub event: String,
    pub current_type: String,
    pub outcome: String,
    /// Status the monitor would answer with
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<(u64, u64)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ram: Option<RamPlan>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RamPlan {
    pub final_type: String,
    pub disable_dim: bool,
}

fn sizing_config(args: &PlanArgs) -> SizingConfig {
    let mut config = SizingConfig {
        no_dim_first: args.no_dim_first,
        ..Default::default()
    };
    if let Some(v) = args.max_ram_gb {
        config.max_ram_gb = v;
    }
    if let Some(v) = args.max_disk_gb {
        config.max_disk_gb = v;
    }
    config
}

/// Run the engine and describe the result
pub fn plan(
    engine: &SizingEngine,
    event: &Event,
    current_type: &str,
    catalog: &[InstanceType],
) -> PlanReport {
    let mut report = PlanReport {
        event: event.event.to_string(),
        current_type: current_type.to_string(),
        outcome: String::new(),
        status: 200,
        disk: None,
        ram: None,
    };

    if !event.event.triggers_sizing() {
        report.outcome = "not a sizing event".into();
        return report;
    }

    match engine.decide(event, current_type, Some(catalog)) {
        Ok(decision) => describe(&mut report, &decision),
        Err(rejection) => {
            report.status = rejection.status;
            report.outcome = rejection.reason;
        }
    }
    report
}

fn describe(report: &mut PlanReport, decision: &SizingDecision) {
    report.disk = decision.disk.map(|d| (d.initial_gb, d.final_gb));
    report.ram = decision.ram.as_ref().map(|r| RamPlan {
        final_type: r.final_type.clone(),
        disable_dim: r.disable_dim,
    });
    let (status, outcome) = match decision.path() {
        SizingPath::None => (200, "sizing: not required"),
        SizingPath::DiskOnly => (200, "sizing: adding disk capacity"),
        SizingPath::RamOnly => (418, "sizing: instance-ram"),
        SizingPath::DiskAndRam => (418, "sizing: instance-disk-and-ram"),
    };
    report.status = status;
    report.outcome = outcome.into();
}

pub fn run_plan(args: &PlanArgs, format: OutputFormat, verbose: bool) -> Result<()> {
    let event: Event = read_json(&args.event)?;
    let catalog: Vec<InstanceType> = read_json(&args.catalog)?;
    let engine = SizingEngine::new(sizing_config(args), args.backend.into());

    if verbose && matches!(format, OutputFormat::Table) {
        let sys = event.system();
        print_info(&format!(
            "memory {} free of {}, disk {} free of {}",
            format_gib(sys.memory_free_bytes),
            format_gib(sys.memory_total_bytes),
            format_gib(sys.disk_free_bytes),
            format_gib(sys.disk_total_bytes),
        ));
        if event.event == EventKind::PreProcessComplete {
            let (dim, no_dim) = engine.preprocess_requirements(&event);
            print_info(&format!("required RAM: {dim} GiB with DIM, {no_dim} GiB without"));
        }
    }

    let report = plan(&engine, &event, &args.current_type, &catalog);
    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            println!("{}", "Sizing Plan".bold());
            let mut rows = vec![
                FieldRow::new("Event", &report.event),
                FieldRow::new("Current Type", &report.current_type),
                FieldRow::new("Response", report.status),
            ];
            if let Some((from, to)) = report.disk {
                rows.push(FieldRow::new("Disk", format!("{from} GB -> {to} GB")));
            }
            if let Some(ram) = &report.ram {
                rows.push(FieldRow::new("New Type", &ram.final_type));
                rows.push(FieldRow::new("Disable DIM", ram.disable_dim));
            }
            print_fields(rows);
            match report.status {
                200 => print_success(&report.outcome),
                418 => print_warning(&report.outcome),
                _ => print_warning(&format!("rejected: {}", report.outcome)),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use monitor_lib::{IngestStatus, SystemSnapshot, GIB};

    fn catalog() -> Vec<InstanceType> {
        [("r6a.large", 16.0), ("r6a.xlarge", 32.0), ("r6a.2xlarge", 64.0)]
            .into_iter()
            .map(|(name, gib)| InstanceType {
                name: name.into(),
                memory_gib: gib,
                cpus: 2,
            })
            .collect()
    }

    fn pressured(free_gb: u64) -> Event {
        Event {
            agi_name: "agi-1".into(),
            event: EventKind::ResourceMonitor,
            ingest_status: IngestStatus {
                system: SystemSnapshot {
                    memory_total_bytes: 32 * GIB,
                    memory_free_bytes: free_gb * GIB,
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_pressure_steps_up_one_type() {
        let engine = SizingEngine::new(SizingConfig::default(), BackendKind::Aws);
        let report = plan(&engine, &pressured(1), "r6a.xlarge", &catalog());
        assert_eq!(report.status, 418);
        assert_eq!(report.ram.unwrap().final_type, "r6a.2xlarge");
    }

    #[test]
    fn test_quiet_event_needs_nothing() {
        let engine = SizingEngine::new(SizingConfig::default(), BackendKind::Aws);
        let report = plan(&engine, &pressured(20), "r6a.xlarge", &catalog());
        assert_eq!(report.status, 200);
        assert_eq!(report.outcome, "sizing: not required");
        assert!(report.ram.is_none());
    }

    #[test]
    fn test_exhausted_family_reports_rejection() {
        let engine = SizingEngine::new(SizingConfig::default(), BackendKind::Aws);
        let report = plan(&engine, &pressured(1), "r6a.2xlarge", &catalog());
        assert_eq!(report.status, 400);
        assert!(report.outcome.starts_with("sizing: "));
    }

    #[test]
    fn test_informational_event_skipped() {
        let engine = SizingEngine::new(SizingConfig::default(), BackendKind::Aws);
        let event = Event {
            event: EventKind::Other("INGEST_PROGRESS".into()),
            ..Default::default()
        };
        let report = plan(&engine, &event, "r6a.xlarge", &catalog());
        assert_eq!(report.outcome, "not a sizing event");
    }

    #[test]
    fn test_flags_override_caps() {
        let args = PlanArgs {
            event: PathBuf::from("e.json"),
            catalog: PathBuf::from("c.json"),
            current_type: "r6a.xlarge".into(),
            backend: Backend::Gcp,
            no_dim_first: true,
            max_ram_gb: Some(64),
            max_disk_gb: None,
        };
        let config = sizing_config(&args);
        assert!(config.no_dim_first);
        assert_eq!(config.max_ram_gb, 64);
        assert_eq!(config.max_disk_gb, 400);
    }
}
