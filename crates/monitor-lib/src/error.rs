//! Error types for the monitor library

use thiserror::Error;

/// Payload decoding failures (base64, gzip, JSON)
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("base64 decode: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("gzip decode: {0}")]
    Gzip(std::io::Error),

    #[error("json decode: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reasons an inbound event is refused authentication
///
/// The caller only ever sees a coarse reason; `Display` is the detailed log line.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth header missing")]
    MissingHeader,

    #[error("auth header invalid: {0}")]
    InvalidHeader(#[source] DecodeError),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("auth:1 image id mismatch: claimed={claimed} actual={actual}")]
    ImageMismatch { claimed: String, actual: String },

    #[error("auth:2 private ip mismatch: claimed={claimed} actual={actual}")]
    PrivateIpMismatch { claimed: String, actual: String },

    #[error("auth:3 zone mismatch: claimed={claimed} actual={actual}")]
    ZoneMismatch { claimed: String, actual: String },

    #[error("auth:4 security group mismatch: {group}")]
    SecurityGroupMismatch { group: String },

    #[error("auth:5 instance type mismatch: claimed={claimed} actual={actual}")]
    InstanceTypeMismatch { claimed: String, actual: String },

    #[error("auth:6 source ip {source_ip} is not an address of the instance")]
    SourceIpMismatch { source_ip: String },

    #[error("auth:7 challenge callback not accepted")]
    ChallengeRejected,

    #[error("auth:7 challenge callback failed: {0}")]
    ChallengeFailed(String),
}

impl AuthError {
    /// Only malformed or absent credentials feed the ban tracker
    pub fn counts_toward_ban(&self) -> bool {
        matches!(self, AuthError::MissingHeader | AuthError::InvalidHeader(_))
    }

    /// Text returned to the caller
    pub fn public_reason(&self) -> &'static str {
        match self {
            AuthError::MissingHeader => "auth header missing",
            AuthError::InvalidHeader(_) => "auth header invalid json",
            AuthError::InstanceNotFound(_) => "auth: instance not found",
            _ => "auth: incorrect",
        }
    }

    /// Short label used for the auth failure metric
    pub fn metric_label(&self) -> &'static str {
        match self {
            AuthError::MissingHeader => "missing_header",
            AuthError::InvalidHeader(_) => "invalid_header",
            AuthError::InstanceNotFound(_) => "instance_not_found",
            AuthError::ImageMismatch { .. } => "image",
            AuthError::PrivateIpMismatch { .. } => "private_ip",
            AuthError::ZoneMismatch { .. } => "zone",
            AuthError::SecurityGroupMismatch { .. } => "security_group",
            AuthError::InstanceTypeMismatch { .. } => "instance_type",
            AuthError::SourceIpMismatch { .. } => "source_ip",
            AuthError::ChallengeRejected => "challenge_rejected",
            AuthError::ChallengeFailed(_) => "challenge_failed",
        }
    }
}

/// Instance-type stepping failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SizingError {
    #[error("instance type '{0}' not found")]
    UnknownInstanceType(String),

    #[error("family not found for instance type '{0}'")]
    FamilyNotFound(String),

    #[error("family type cannot be sized: '{0}'")]
    FamilyCannotBeSized(String),

    #[error("family not in list or list exhausted")]
    FamilyExhausted,

    #[error("sizing exhausted, largest available is {largest}")]
    Exhausted { largest: String },
}

/// Remediation job failures, surfaced through logs and notifications only
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("CRITICAL: member name is empty, refusing destructive action")]
    EmptyMemberName,

    #[error("invalid deployment json: {0}")]
    Deployment(#[from] DecodeError),

    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("{context}: {source}")]
    Backend {
        context: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("volume resized but filesystem resize failed: {0}")]
    ResizeFs(#[source] anyhow::Error),

    #[error("{disk} ; {ram}")]
    Combined { disk: String, ram: String },
}

impl OrchestrationError {
    pub fn backend(context: &'static str, source: anyhow::Error) -> Self {
        OrchestrationError::Backend { context, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_header_errors_count_toward_ban() {
        assert!(AuthError::MissingHeader.counts_toward_ban());
        assert!(!AuthError::InstanceNotFound("i-1".into()).counts_toward_ban());
        assert!(!AuthError::ChallengeFailed("timeout".into()).counts_toward_ban());
        assert!(!AuthError::PrivateIpMismatch {
            claimed: "10.0.0.1".into(),
            actual: "10.0.0.2".into()
        }
        .counts_toward_ban());
    }

    #[test]
    fn test_mismatches_share_public_reason() {
        let image = AuthError::ImageMismatch {
            claimed: "a".into(),
            actual: "b".into(),
        };
        let source = AuthError::SourceIpMismatch {
            source_ip: "1.2.3.4".into(),
        };
        assert_eq!(image.public_reason(), source.public_reason());
        assert!(image.to_string().starts_with("auth:1"));
        assert!(source.to_string().starts_with("auth:6"));
    }

    #[test]
    fn test_combined_error_message() {
        let err = OrchestrationError::Combined {
            disk: "volume not found: agi-1".into(),
            ram: "destroy failed".into(),
        };
        assert_eq!(err.to_string(), "volume not found: agi-1 ; destroy failed");
    }
}
