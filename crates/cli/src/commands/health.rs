//! Monitor health probe

use anyhow::{bail, Result};
use colored::Colorize;

use crate::client::MonitorClient;
use crate::output::{
    color_status_code, print_error, print_fields, print_json, print_success, FieldRow,
    OutputFormat,
};

/// Probe /agi/health and fail when the monitor is not healthy
pub async fn check_health(client: &MonitorClient, format: OutputFormat, verbose: bool) -> Result<()> {
    let report = client.health().await?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            println!("{}", "Monitor Health".bold());
            let mut rows = vec![
                FieldRow::new("URL", &report.url),
                FieldRow::new("Status", color_status_code(report.status_code)),
                FieldRow::new("Latency", format!("{}ms", report.latency_ms)),
            ];
            if verbose {
                rows.push(FieldRow::new("Body", report.body.trim()));
                rows.push(FieldRow::new("Checked", &report.checked_at));
            }
            print_fields(rows);
            if report.is_healthy() {
                print_success("Monitor is healthy");
            } else {
                print_error("Monitor is not healthy");
            }
        }
    }

    if !report.is_healthy() {
        bail!("health check failed with status {}", report.status_code);
    }
    Ok(())
}
