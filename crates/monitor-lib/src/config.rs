//! Monitor configuration
//!
//! Every field carries a default so a partial file or a handful of
//! environment variables is enough to start the service.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::BackendKind;

#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Top-level monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Listener bind address
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Cloud flavour of the fleet
    #[serde(default)]
    pub backend_type: BackendKind,

    /// Region, used to build legacy member DNS names
    #[serde(default)]
    pub region: String,

    #[serde(default)]
    pub tls: TlsConfig,

    /// Verify member certificates on outbound callbacks
    #[serde(default)]
    pub strict_member_tls: bool,

    /// Port override for member callbacks
    #[serde(default)]
    pub member_port: Option<u16>,

    #[serde(default)]
    pub sizing: SizingConfig,

    #[serde(default)]
    pub capacity: CapacityConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    /// Log every decoded event
    #[serde(default)]
    pub debug_events: bool,

    #[serde(default)]
    pub fleet: FleetConfig,

    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    None,
    #[default]
    SelfSigned,
    Custom,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub mode: TlsMode,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

/// Thresholds and caps for the sizing engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    #[serde(default)]
    pub disable: bool,

    /// Prefer turning off data-in-memory before stepping the instance type
    #[serde(default)]
    pub no_dim_first: bool,

    #[serde(default = "default_max_ram_gb")]
    pub max_ram_gb: u64,

    #[serde(default = "default_max_disk_gb")]
    pub max_disk_gb: u64,

    #[serde(default = "default_ram_used_pct")]
    pub ram_used_pct: u32,

    #[serde(default = "default_ram_min_free_gb")]
    pub ram_min_free_gb: u64,

    /// GCP only
    #[serde(default = "default_disk_used_pct")]
    pub disk_used_pct: u32,

    /// GCP only
    #[serde(default = "default_disk_increase_gb")]
    pub disk_increase_gb: u64,

    #[serde(default = "default_dim_multiplier")]
    pub dim_multiplier: f64,

    #[serde(default = "default_no_dim_multiplier")]
    pub no_dim_multiplier: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapacityConfig {
    #[serde(default)]
    pub disable: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// JSON webhook endpoint
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Extra webhook headers as `Name=value`
    #[serde(default)]
    pub headers: Vec<String>,

    #[serde(default)]
    pub slack_token: Option<String>,

    #[serde(default)]
    pub slack_channel: Option<String>,
}

impl NotifyConfig {
    /// Parse `Name=value` header strings, skipping entries without a `=`
    pub fn parsed_headers(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter_map(|h| h.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.to_string()))
            .filter(|(k, _)| !k.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Fleet CLI driven by the exec backend
    #[serde(default = "default_fleet_binary")]
    pub binary: String,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            binary: default_fleet_binary(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

fn default_listen_address() -> String {
    "0.0.0.0:443".to_string()
}

fn default_max_ram_gb() -> u64 {
    130
}

fn default_max_disk_gb() -> u64 {
    400
}

fn default_ram_used_pct() -> u32 {
    95
}

fn default_ram_min_free_gb() -> u64 {
    8
}

fn default_disk_used_pct() -> u32 {
    80
}

fn default_disk_increase_gb() -> u64 {
    100
}

fn default_dim_multiplier() -> f64 {
    1.8
}

fn default_no_dim_multiplier() -> f64 {
    0.4
}

fn default_fleet_binary() -> String {
    "aerolab".to_string()
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            disable: false,
            no_dim_first: false,
            max_ram_gb: default_max_ram_gb(),
            max_disk_gb: default_max_disk_gb(),
            ram_used_pct: default_ram_used_pct(),
            ram_min_free_gb: default_ram_min_free_gb(),
            disk_used_pct: default_disk_used_pct(),
            disk_increase_gb: default_disk_increase_gb(),
            dim_multiplier: default_dim_multiplier(),
            no_dim_multiplier: default_no_dim_multiplier(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            backend_type: BackendKind::default(),
            region: String::new(),
            tls: TlsConfig::default(),
            strict_member_tls: false,
            member_port: None,
            sizing: SizingConfig::default(),
            capacity: CapacityConfig::default(),
            notify: NotifyConfig::default(),
            debug_events: false,
            fleet: FleetConfig::default(),
            log_format: LogFormat::default(),
        }
    }
}

impl MonitorConfig {
    /// Reject settings the service cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.sizing;
        if s.dim_multiplier <= 0.0 || s.no_dim_multiplier <= 0.0 {
            return Err(ConfigError("sizing multipliers must be positive".into()));
        }
        for (name, pct) in [
            ("sizing.ram_used_pct", s.ram_used_pct),
            ("sizing.disk_used_pct", s.disk_used_pct),
        ] {
            if !(1..=100).contains(&pct) {
                return Err(ConfigError(format!("{name} must be within 1..=100, got {pct}")));
            }
        }
        if self.tls.mode == TlsMode::Custom
            && (self.tls.cert_file.is_none() || self.tls.key_file.is_none())
        {
            return Err(ConfigError(
                "tls.mode=custom requires tls.cert_file and tls.key_file".into(),
            ));
        }
        if self.notify.slack_token.is_some() != self.notify.slack_channel.is_some() {
            return Err(ConfigError(
                "notify.slack_token and notify.slack_channel must be set together".into(),
            ));
        }
        if self.fleet.binary.trim().is_empty() {
            return Err(ConfigError("fleet.binary must not be empty".into()));
        }
        Ok(())
    }
}
