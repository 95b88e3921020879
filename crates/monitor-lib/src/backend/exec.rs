//! Backend that drives the fleet CLI as a subprocess

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{Backend, RemoteExec, StartOverrides};
use crate::models::{BackendKind, InstanceType, Inventory, Volume, MEMBER_KIND};

/// Timeout for fleet CLI calls that have no operation-specific bound
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Production [`Backend`] and [`RemoteExec`] over the fleet CLI
///
/// Every call runs the configured binary with JSON output and parses stdout.
#[derive(Debug, Clone)]
pub struct ExecBackend {
    binary: String,
    kind: BackendKind,
}

impl ExecBackend {
    pub fn new(binary: impl Into<String>, kind: BackendKind) -> Self {
        Self {
            binary: binary.into(),
            kind,
        }
    }

    async fn run(&self, args: &[String], timeout: Duration) -> Result<Vec<u8>> {
        debug!(binary = %self.binary, args = ?args, "Running fleet command");
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .with_context(|| format!("{} {} timed out", self.binary, args.join(" ")))?
            .with_context(|| format!("failed to run {}", self.binary))?;

        if !output.status.success() {
            bail!(
                "{} {} exited with {}: {}",
                self.binary,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }

    fn member_args(verb: &[&str], name: &str) -> Vec<String> {
        let mut args: Vec<String> = verb.iter().map(|s| s.to_string()).collect();
        args.extend([
            "--type".to_string(),
            MEMBER_KIND.to_string(),
            "--name".to_string(),
            name.to_string(),
        ]);
        args
    }
}

/// Arguments for `agi start`, applying only the overrides that are set
fn start_args(name: &str, overrides: &StartOverrides) -> Vec<String> {
    let mut args = vec![
        "agi".to_string(),
        "start".to_string(),
        "--name".to_string(),
        name.to_string(),
    ];
    if let Some(instance_type) = &overrides.instance_type {
        args.push(format!("--instance-type={instance_type}"));
    }
    if let Some(no_dim) = overrides.no_dim {
        args.push(format!("--no-dim={no_dim}"));
    }
    if let Some(spot) = overrides.spot {
        args.push(format!("--spot={spot}"));
    }
    if let Some(owner) = &overrides.owner {
        args.push(format!("--owner={owner}"));
    }
    args
}

#[async_trait]
impl Backend for ExecBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn force_refresh_inventory(&self) -> Result<()> {
        self.run(
            &["inventory".into(), "refresh".into()],
            DEFAULT_COMMAND_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    async fn get_inventory(&self) -> Result<Inventory> {
        let out = self
            .run(
                &["inventory".into(), "list".into(), "--json".into()],
                DEFAULT_COMMAND_TIMEOUT,
            )
            .await?;
        serde_json::from_slice(&out).context("failed to parse inventory json")
    }

    async fn get_instance_types(&self) -> Result<Vec<InstanceType>> {
        let out = self
            .run(
                &[
                    "inventory".into(),
                    "instance-types".into(),
                    "--json".into(),
                ],
                DEFAULT_COMMAND_TIMEOUT,
            )
            .await?;
        serde_json::from_slice(&out).context("failed to parse instance types json")
    }

    async fn resize_volume(
        &self,
        volume: &Volume,
        new_size_gb: u64,
        timeout: Duration,
    ) -> Result<()> {
        let args = vec![
            "volumes".to_string(),
            "resize".to_string(),
            "--name".to_string(),
            volume.name.clone(),
            "--zone".to_string(),
            volume.zone.clone(),
            format!("--size={new_size_gb}"),
        ];
        self.run(&args, timeout).await.map(|_| ())
    }

    async fn destroy_member(&self, name: &str) -> Result<()> {
        ensure!(!name.is_empty(), "refusing to destroy with an empty member name");
        let mut args = Self::member_args(&["instances", "destroy"], name);
        args.push("--force".to_string());
        self.run(&args, DEFAULT_COMMAND_TIMEOUT).await.map(|_| ())
    }

    async fn add_tags(&self, name: &str, tags: &HashMap<String, String>) -> Result<()> {
        ensure!(!name.is_empty(), "refusing to tag with an empty member name");
        let mut args = Self::member_args(&["instances", "add-tags"], name);
        for (k, v) in tags {
            args.push(format!("--tag={k}={v}"));
        }
        self.run(&args, DEFAULT_COMMAND_TIMEOUT).await.map(|_| ())
    }

    async fn start_member(&self, name: &str, overrides: &StartOverrides) -> Result<()> {
        ensure!(!name.is_empty(), "refusing to start with an empty member name");
        self.run(&start_args(name, overrides), DEFAULT_COMMAND_TIMEOUT)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl RemoteExec for ExecBackend {
    async fn write_file(&self, name: &str, path: &str, contents: &[u8], mode: u32) -> Result<()> {
        let local = std::env::temp_dir().join(format!("agimonitor-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&local, contents)
            .await
            .with_context(|| format!("failed to stage {}", local.display()))?;

        let mut args = Self::member_args(&["files", "upload"], name);
        args.extend([
            "--node=1".to_string(),
            format!("--mode={mode:o}"),
            local.display().to_string(),
            path.to_string(),
        ]);
        let result = self.run(&args, DEFAULT_COMMAND_TIMEOUT).await.map(|_| ());

        if let Err(e) = tokio::fs::remove_file(&local).await {
            debug!(path = %local.display(), error = %e, "Failed to remove staged file");
        }
        result
    }
}
