//! Monitor configuration loading

use std::path::Path;

use anyhow::{Context, Result};
use monitor_lib::MonitorConfig;

/// Config file read when `AGIMONITOR_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "/etc/agimonitor.yaml";

const ENV_PREFIX: &str = "AGIMONITOR";

/// Load configuration from the config file and environment
pub fn load() -> Result<MonitorConfig> {
    let path = std::env::var(format!("{ENV_PREFIX}_CONFIG"))
        .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_from(Path::new(&path))
}

/// Load from an optional YAML file, with `AGIMONITOR_*` variables on top.
///
/// Nested keys use `__`, e.g. `AGIMONITOR_SIZING__MAX_RAM_GB=256`.
pub fn load_from(path: &Path) -> Result<MonitorConfig> {
    let settings = config::Config::builder()
        .add_source(
            config::File::from(path)
                .format(config::FileFormat::Yaml)
                .required(false),
        )
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("notify.headers"),
        )
        .build()
        .with_context(|| format!("failed to read configuration from {}", path.display()))?;

    let config: MonitorConfig = settings
        .try_deserialize()
        .context("invalid monitor configuration")?;
    config.validate().context("monitor configuration rejected")?;
    Ok(config)
}
