//! Notification dispatch for remediation jobs
//!
//! Each job stage is sent as a JSON document to an optional webhook and as a
//! formatted message to an optional chat channel. Delivery is best effort:
//! failures are logged and never reach the job.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Serialize, Serializer};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::NotifyConfig;
use crate::models::Event;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);
const SLACK_API_URL: &str = "https://slack.com/api/chat.postMessage";

/// Remediation job kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    SpotCapacity,
    SizingRam,
    SizingDisk,
    SizingDiskRam,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::SpotCapacity => "spot-capacity",
            ActionKind::SizingRam => "sizing-ram",
            ActionKind::SizingDisk => "sizing-disk",
            ActionKind::SizingDiskRam => "sizing-disk-ram",
        }
    }

    /// Event name used in chat messages
    fn chat_event(&self) -> &'static str {
        match self {
            ActionKind::SpotCapacity => "INSTANCE_SPOT_CAPACITY",
            ActionKind::SizingRam => "INSTANCE_SIZING_RAM",
            ActionKind::SizingDisk => "INSTANCE_SIZING_DISK",
            ActionKind::SizingDiskRam => "INSTANCE_SIZING_DISK_RAM",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            ActionKind::SpotCapacity => "rotating instance from SPOT to ON_DEMAND",
            ActionKind::SizingRam => "increasing instance size",
            ActionKind::SizingDisk => "increasing disk size",
            ActionKind::SizingDiskRam => "increasing instance and disk size",
        }
    }
}

impl Serialize for ActionKind {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

/// Job stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Start,
    Done,
    Error,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::Done => "done",
            Stage::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiskSizes {
    #[serde(rename = "InitialSizeGB")]
    pub initial_size_gb: u64,
    #[serde(rename = "FinalSizeGB")]
    pub final_size_gb: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RamSizes {
    #[serde(rename = "InitialInstanceType")]
    pub initial_instance_type: String,
    #[serde(rename = "FinalInstanceType")]
    pub final_instance_type: String,
    #[serde(rename = "DisableDIM")]
    pub disable_dim: bool,
}

/// One stage of one job, as delivered to the webhook
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NotifyRecord {
    pub name: String,
    pub action: ActionKind,
    pub stage: Stage,
    pub error: String,
    pub disk: DiskSizes,
    #[serde(rename = "RAM")]
    pub ram: RamSizes,
    pub event: Event,
}

impl NotifyRecord {
    pub fn new(action: ActionKind, event: &Event) -> Self {
        Self {
            name: event.agi_name.clone(),
            action,
            stage: Stage::Start,
            error: String::new(),
            disk: DiskSizes::default(),
            ram: RamSizes::default(),
            event: event.clone(),
        }
    }

    /// Copy of this record at another stage
    pub fn at(&self, stage: Stage, error: Option<&str>) -> Self {
        let mut record = self.clone();
        record.stage = stage;
        record.error = error.unwrap_or_default().to_string();
        record
    }

    fn stage_line(&self) -> String {
        match self.stage {
            Stage::Start => "*Stage*: Job Start".to_string(),
            Stage::Done => "*Stage*: Job Done".to_string(),
            Stage::Error => format!("*Stage*: Error ({})", self.error),
        }
    }

    /// Chat message text
    pub fn chat_message(&self) -> String {
        let mut sources = String::new();
        for (label, value) in [
            ("S3", &self.event.s3_source),
            ("SFTP", &self.event.sftp_source),
            ("Local", &self.event.local_source),
        ] {
            if !value.is_empty() {
                sources.push_str(&format!("\n> *{label}*: {value}"));
            }
        }
        format!(
            "*MONITOR_{}* _@ {}_\n> *AGI Name*: {}\n> *AGI Label*: {}\n> *Owner*: {}{}\n> *AGI Monitor {}*\n> {}",
            self.action.chat_event(),
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            self.name,
            self.event.label,
            self.event.owner,
            sources,
            self.action.description(),
            self.stage_line(),
        )
    }
}

#[derive(Clone)]
struct SlackTarget {
    url: String,
    token: String,
    channel: String,
}

/// Best-effort webhook and chat delivery
#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    webhook: Option<String>,
    headers: Vec<(String, String)>,
    slack: Option<SlackTarget>,
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Notifier {
    pub fn new(config: &NotifyConfig) -> Self {
        let slack = match (&config.slack_token, &config.slack_channel) {
            (Some(token), Some(channel)) => Some(SlackTarget {
                url: SLACK_API_URL.to_string(),
                token: token.clone(),
                channel: channel.clone(),
            }),
            _ => None,
        };
        Self {
            client: reqwest::Client::new(),
            webhook: config.endpoint.clone().filter(|e| !e.is_empty()),
            headers: config.parsed_headers(),
            slack,
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Send chat messages to another API endpoint
    pub fn with_slack_url(mut self, url: impl Into<String>) -> Self {
        if let Some(slack) = self.slack.as_mut() {
            slack.url = url.into();
        }
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.webhook.is_some() || self.slack.is_some()
    }

    /// Queue delivery of a record and return immediately
    pub fn notify(&self, record: NotifyRecord) {
        if !self.is_enabled() {
            return;
        }
        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.deliver(&record).await;
        });
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Wait for queued deliveries, up to `timeout`
    pub async fn flush(&self, timeout: Duration) {
        let handles: Vec<JoinHandle<()>> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };
        let all = async {
            for h in handles {
                let _ = h.await;
            }
        };
        if tokio::time::timeout(timeout, all).await.is_err() {
            warn!("Timed out waiting for notifications to be delivered");
        }
    }

    async fn deliver(&self, record: &NotifyRecord) {
        if let Some(url) = &self.webhook {
            if let Err(e) = self.send_webhook(url, record).await {
                warn!(action = record.action.as_str(), stage = record.stage.as_str(), error = %e, "Webhook notification failed");
            }
        }
        if let Some(slack) = &self.slack {
            if let Err(e) = self.send_slack(slack, record).await {
                warn!(action = record.action.as_str(), stage = record.stage.as_str(), error = %e, "Chat notification failed");
            }
        }
    }

    async fn send_webhook(&self, url: &str, record: &NotifyRecord) -> anyhow::Result<()> {
        let mut req = self.client.post(url).timeout(NOTIFY_TIMEOUT).json(record);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("webhook returned {}: {}", status.as_u16(), body);
        }
        debug!(url = %url, stage = record.stage.as_str(), "Webhook notification sent");
        Ok(())
    }

    async fn send_slack(&self, slack: &SlackTarget, record: &NotifyRecord) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "channel": slack.channel,
            "text": record.chat_message(),
        });
        let resp = self
            .client
            .post(&slack.url)
            .bearer_auth(&slack.token)
            .timeout(NOTIFY_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("chat API returned {}", status.as_u16());
        }
        Ok(())
    }
}
