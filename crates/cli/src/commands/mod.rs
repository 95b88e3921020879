//! CLI command implementations

pub mod auth;
pub mod health;
pub mod plan;

use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Read and parse a JSON file
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}
