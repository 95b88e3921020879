//! Core data models for the monitor
//!
//! Wire names follow what fleet members already send, so most structs carry
//! explicit serde renames rather than Rust-side naming.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::DecodeError;

/// Bytes per GiB
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Member type served by the monitor. The monitor's own instance has a different type.
pub const MEMBER_KIND: &str = "agi";

/// Tag written while remediation is in progress
pub const MONITOR_STATE_TAG: &str = "monitorState";

/// Event kinds a fleet member can report
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    InitComplete,
    DownloadComplete,
    UnpackComplete,
    PreProcessComplete,
    ProcessComplete,
    IngestFinished,
    ResourceMonitor,
    ServiceDown,
    ServiceUp,
    SpotNoCapacity,
    MaxAge,
    MaxInactive,
    /// Anything this monitor does not know about; acknowledged and ignored
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::InitComplete => "INGEST_STEP_INIT_COMPLETE",
            EventKind::DownloadComplete => "INGEST_STEP_DOWNLOAD_COMPLETE",
            EventKind::UnpackComplete => "INGEST_STEP_UNPACK_COMPLETE",
            EventKind::PreProcessComplete => "INGEST_STEP_PREPROCESS_COMPLETE",
            EventKind::ProcessComplete => "INGEST_STEP_PROCESS_COMPLETE",
            EventKind::IngestFinished => "INGEST_FINISHED",
            EventKind::ResourceMonitor => "SYS_RESOURCE_USAGE_MONITOR",
            EventKind::ServiceDown => "SERVICE_DOWN",
            EventKind::ServiceUp => "SERVICE_UP",
            EventKind::SpotNoCapacity => "SPOT_INSTANCE_CAPACITY_SHUTDOWN",
            EventKind::MaxAge => "MAX_AGE_REACHED",
            EventKind::MaxInactive => "MAX_INACTIVITY_REACHED",
            EventKind::Other(s) => s,
        }
    }

    /// Event kinds that feed the sizing engine
    pub fn triggers_sizing(&self) -> bool {
        matches!(
            self,
            EventKind::InitComplete
                | EventKind::DownloadComplete
                | EventKind::UnpackComplete
                | EventKind::PreProcessComplete
                | EventKind::ResourceMonitor
                | EventKind::ServiceDown
        )
    }
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "INGEST_STEP_INIT_COMPLETE" => EventKind::InitComplete,
            "INGEST_STEP_DOWNLOAD_COMPLETE" => EventKind::DownloadComplete,
            "INGEST_STEP_UNPACK_COMPLETE" => EventKind::UnpackComplete,
            "INGEST_STEP_PREPROCESS_COMPLETE" => EventKind::PreProcessComplete,
            "INGEST_STEP_PROCESS_COMPLETE" => EventKind::ProcessComplete,
            "INGEST_FINISHED" => EventKind::IngestFinished,
            "SYS_RESOURCE_USAGE_MONITOR" => EventKind::ResourceMonitor,
            "SERVICE_DOWN" => EventKind::ServiceDown,
            "SERVICE_UP" => EventKind::ServiceUp,
            "SPOT_INSTANCE_CAPACITY_SHUTDOWN" => EventKind::SpotNoCapacity,
            "MAX_AGE_REACHED" => EventKind::MaxAge,
            "MAX_INACTIVITY_REACHED" => EventKind::MaxInactive,
            _ => EventKind::Other(s),
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl Default for EventKind {
    fn default() -> Self {
        EventKind::Other(String::new())
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ingest pipeline progress as reported by the member
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct IngestProgress {
    pub running: bool,
    pub downloader_complete_pct: i64,
    pub downloader_total_size: i64,
    pub log_processor_complete_pct: i64,
    pub log_processor_total_size: i64,
    pub log_processor_complete_size: i64,
    pub errors: Vec<String>,
}

/// Disk and memory totals of the member host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SystemSnapshot {
    pub disk_total_bytes: u64,
    pub disk_free_bytes: u64,
    pub memory_total_bytes: u64,
    pub memory_free_bytes: u64,
}

impl SystemSnapshot {
    pub fn disk_total_gb(&self) -> u64 {
        self.disk_total_bytes / GIB
    }
}

/// Service and resource status attached to every event
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct IngestStatus {
    pub ingest: IngestProgress,
    /// Core database process
    #[serde(rename = "AerospikeRunning")]
    pub database_running: bool,
    pub plugin_running: bool,
    pub grafana_helper_running: bool,
    pub system: SystemSnapshot,
}

/// Payload a fleet member posts to the monitor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Event {
    #[serde(rename = "AGIName")]
    pub agi_name: String,
    pub event: EventKind,
    pub event_detail: String,
    pub is_data_in_memory: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub ingest_status: IngestStatus,
    pub deployment_json_gz_b64: String,
    #[serde(rename = "SSHAuthorizedKeysFileGzB64")]
    pub ssh_authorized_keys_file_gz_b64: String,
    pub label: String,
    pub owner: String,
    pub s3_source: String,
    pub sftp_source: String,
    pub local_source: String,
}

impl Event {
    /// Decode and parse the embedded deployment descriptor
    pub fn deployment(&self) -> Result<DeploymentDescriptor, DecodeError> {
        let raw = decode_gzip_b64(&self.deployment_json_gz_b64)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Decode the authorized_keys blob, `None` when the member sent none
    pub fn authorized_keys(&self) -> Result<Option<Vec<u8>>, DecodeError> {
        if self.ssh_authorized_keys_file_gz_b64.is_empty() {
            return Ok(None);
        }
        decode_gzip_b64(&self.ssh_authorized_keys_file_gz_b64).map(Some)
    }

    pub fn system(&self) -> &SystemSnapshot {
        &self.ingest_status.system
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// The deployment a member was created from
///
/// Only the fields the monitor reads are modelled; the rest of the document is ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DeploymentDescriptor {
    pub cluster_name: String,
    #[serde(rename = "AGILabel")]
    pub label: String,
    #[serde(rename = "NoDIM")]
    pub no_dim: bool,
    pub owner: String,
}

/// Decode a base64 string holding gzip-compressed bytes
pub fn decode_gzip_b64(value: &str) -> Result<Vec<u8>, DecodeError> {
    let compressed = STANDARD.decode(value.trim())?;
    let mut out = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut out)
        .map_err(DecodeError::Gzip)?;
    Ok(out)
}

/// Gzip-compress and base64-encode bytes, the inverse of [`decode_gzip_b64`]
pub fn encode_gzip_b64(data: &[u8]) -> String {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    // Writes into a Vec cannot fail.
    let _ = encoder.write_all(data);
    let compressed = encoder.finish().unwrap_or_default();
    STANDARD.encode(compressed)
}

/// Claims carried in the `Agi-Monitor-Auth` header, read by the member from its cloud metadata service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthClaims {
    #[serde(rename = "accountId")]
    pub account_project_id: String,
    #[serde(rename = "availabilityZone")]
    pub availability_zone: String,
    #[serde(rename = "imageId")]
    pub image_id: String,
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    #[serde(rename = "instanceType")]
    pub instance_type: String,
    #[serde(rename = "privateIp")]
    pub private_ip: String,
    #[serde(rename = "securityGroups")]
    pub security_groups: Vec<String>,
}

impl AuthClaims {
    /// Decode a header value: base64 of the JSON claims document
    pub fn decode(header: &str) -> Result<Self, DecodeError> {
        let raw = STANDARD.decode(header.trim())?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn encode(&self) -> String {
        STANDARD.encode(serde_json::to_vec(self).unwrap_or_default())
    }
}

/// Cloud provider flavour the fleet runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Aws,
    Gcp,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Aws => write!(f, "aws"),
            BackendKind::Gcp => write!(f, "gcp"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceIps {
    pub public: String,
    pub private: String,
}

impl InstanceIps {
    pub fn contains(&self, ip: &str) -> bool {
        !ip.is_empty() && (self.public == ip || self.private == ip)
    }
}

/// A fleet member as the backend sees it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Instance {
    pub instance_id: String,
    /// Member (cluster) name
    pub name: String,
    /// Member type, e.g. `agi` or `agimonitor`
    pub kind: String,
    pub zone: String,
    pub image_id: String,
    pub instance_type: String,
    pub ip: InstanceIps,
    pub tags: HashMap<String, String>,
    /// Security group names (AWS) or network tags (GCP)
    pub firewalls: Vec<String>,
    pub owner: String,
}

/// A persistent volume holding a member's data
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Volume {
    pub volume_id: String,
    pub name: String,
    pub zone: String,
    pub size_gb: u64,
    pub tags: HashMap<String, String>,
}

/// Snapshot of the fleet; each snapshot is independent of later refreshes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Inventory {
    pub instances: Vec<Instance>,
    pub volumes: Vec<Volume>,
}

impl Inventory {
    /// Find a member of type `agi` by its cloud instance id
    pub fn find_member(&self, instance_id: &str) -> Option<&Instance> {
        self.instances
            .iter()
            .filter(|i| i.kind == MEMBER_KIND)
            .find(|i| i.instance_id == instance_id)
    }

    /// All `agi` instances carrying exactly this member name
    pub fn members_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Instance> + 'a {
        self.instances
            .iter()
            .filter(move |i| i.kind == MEMBER_KIND && !name.is_empty() && i.name == name)
    }

    pub fn volumes_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Volume> + 'a {
        self.volumes
            .iter()
            .filter(move |v| !name.is_empty() && v.name == name)
    }
}

/// One entry of the provider's instance-type catalog
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceType {
    pub name: String,
    pub memory_gib: f64,
    pub cpus: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_wire_names() {
        let kind: EventKind = "SYS_RESOURCE_USAGE_MONITOR".to_string().into();
        assert_eq!(kind, EventKind::ResourceMonitor);
        assert!(kind.triggers_sizing());

        let unknown: EventKind = "SOMETHING_NEW".to_string().into();
        assert_eq!(unknown, EventKind::Other("SOMETHING_NEW".to_string()));
        assert_eq!(unknown.as_str(), "SOMETHING_NEW");
        assert!(!EventKind::SpotNoCapacity.triggers_sizing());
    }

    #[test]
    fn test_event_parses_member_payload() {
        let body = r#"{
            "AGIName": "agi-1",
            "Event": "SERVICE_DOWN",
            "IsDataInMemory": true,
            "IngestStatus": {
                "AerospikeRunning": false,
                "PluginRunning": true,
                "System": {"DiskTotalBytes": 107374182400, "MemoryFreeBytes": 1024}
            },
            "SSHAuthorizedKeysFileGzB64": "",
            "Owner": "ops"
        }"#;
        let event: Event = serde_json::from_str(body).unwrap();

        assert_eq!(event.agi_name, "agi-1");
        assert_eq!(event.event, EventKind::ServiceDown);
        assert!(event.is_data_in_memory);
        assert!(!event.ingest_status.database_running);
        assert_eq!(event.system().disk_total_gb(), 100);
        assert_eq!(event.owner, "ops");
    }

    #[test]
    fn test_event_null_ingest_status() {
        let event: Event =
            serde_json::from_str(r#"{"AGIName":"a","Event":"MAX_AGE_REACHED","IngestStatus":null}"#)
                .unwrap();
        assert_eq!(event.system().memory_free_bytes, 0);
    }

    #[test]
    fn test_deployment_descriptor_decoding() {
        let doc = br#"{"ClusterName":"agi-1","AGILabel":"prod logs","NoDIM":false,"Extra":1}"#;
        let event = Event {
            deployment_json_gz_b64: encode_gzip_b64(doc),
            ..Default::default()
        };

        let deployment = event.deployment().unwrap();
        assert_eq!(deployment.cluster_name, "agi-1");
        assert_eq!(deployment.label, "prod logs");
    }

    #[test]
    fn test_deployment_descriptor_rejects_garbage() {
        let event = Event {
            deployment_json_gz_b64: "not base64 !!".to_string(),
            ..Default::default()
        };
        assert!(event.deployment().is_err());

        let event = Event {
            deployment_json_gz_b64: encode_gzip_b64(b"not json"),
            ..Default::default()
        };
        assert!(matches!(event.deployment(), Err(DecodeError::Json(_))));
    }

    #[test]
    fn test_authorized_keys_optional() {
        let event = Event::default();
        assert!(event.authorized_keys().unwrap().is_none());

        let event = Event {
            ssh_authorized_keys_file_gz_b64: encode_gzip_b64(b"ssh-ed25519 AAAA ops\n"),
            ..Default::default()
        };
        assert_eq!(
            event.authorized_keys().unwrap().unwrap(),
            b"ssh-ed25519 AAAA ops\n".to_vec()
        );
    }

    #[test]
    fn test_auth_claims_header() {
        let claims = AuthClaims {
            instance_id: "i-123".to_string(),
            private_ip: "10.0.0.5".to_string(),
            security_groups: vec!["agi".to_string()],
            ..Default::default()
        };
        let decoded = AuthClaims::decode(&claims.encode()).unwrap();
        assert_eq!(decoded, claims);

        assert!(AuthClaims::decode("%%%").is_err());
    }

    #[test]
    fn test_inventory_member_lookup_skips_other_kinds() {
        let inventory = Inventory {
            instances: vec![
                Instance {
                    instance_id: "i-1".to_string(),
                    name: "monitor".to_string(),
                    kind: "agimonitor".to_string(),
                    ..Default::default()
                },
                Instance {
                    instance_id: "i-2".to_string(),
                    name: "agi-1".to_string(),
                    kind: MEMBER_KIND.to_string(),
                    ..Default::default()
                },
            ],
            volumes: vec![],
        };

        assert!(inventory.find_member("i-1").is_none());
        assert_eq!(inventory.find_member("i-2").unwrap().name, "agi-1");
        assert_eq!(inventory.members_named("agi-1").count(), 1);
        assert_eq!(inventory.members_named("").count(), 0);
    }
}
