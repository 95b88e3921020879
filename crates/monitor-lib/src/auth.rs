//! Authentication of inbound member events
//!
//! A request is accepted only when its claims match the backend's record of
//! the instance, it comes from one of that instance's addresses, and the
//! instance answers a challenge with the secret the request carried.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::challenge::MemberApi;
use crate::error::AuthError;
use crate::inventory::InventoryCache;
use crate::models::{AuthClaims, BackendKind, Instance};

/// Request header carrying the encoded claims
pub const AUTH_HEADER: &str = "Agi-Monitor-Auth";

/// Tag holding the member's DNS name
pub const DNS_NAME_TAG: &str = "agiDNSName";

/// Tag holding the legacy domain suffix
pub const DOMAIN_TAG: &str = "agiDomain";

/// Result of the challenge step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeOutcome {
    Accepted,
    /// The member could not be reached; informational events may still proceed
    Failed(String),
}

/// An event sender that passed steps up to and including field verification
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub claims: AuthClaims,
    pub instance: Instance,
    pub challenge: ChallengeOutcome,
}

impl Authenticated {
    /// Remediation requires a completed challenge
    pub fn require_challenge(&self) -> Result<(), AuthError> {
        match &self.challenge {
            ChallengeOutcome::Accepted => Ok(()),
            ChallengeOutcome::Failed(e) => Err(AuthError::ChallengeFailed(e.clone())),
        }
    }
}

/// Verifies event senders against inventory and by challenge callback
pub struct Authenticator {
    inventory: Arc<InventoryCache>,
    members: Arc<dyn MemberApi>,
    kind: BackendKind,
    region: String,
}

impl Authenticator {
    pub fn new(
        inventory: Arc<InventoryCache>,
        members: Arc<dyn MemberApi>,
        kind: BackendKind,
        region: impl Into<String>,
    ) -> Self {
        Self {
            inventory,
            members,
            kind,
            region: region.into(),
        }
    }

    /// Run header decoding, instance lookup, field verification and the challenge.
    ///
    /// The ban check happens before this, in the caller that owns the tracker.
    pub async fn authenticate(
        &self,
        header: Option<&str>,
        secret: &str,
        source_ip: IpAddr,
    ) -> Result<Authenticated, AuthError> {
        let header = header
            .filter(|h| !h.trim().is_empty())
            .ok_or(AuthError::MissingHeader)?;
        let claims = AuthClaims::decode(header).map_err(AuthError::InvalidHeader)?;

        let instance = self.find_instance(&claims.instance_id).await?;
        verify_instance(self.kind, &claims, &instance, source_ip)?;

        let target = self.challenge_target(&instance, source_ip).await;
        let challenge = match self.members.challenge(&target, secret).await {
            Ok(true) => ChallengeOutcome::Accepted,
            Ok(false) => return Err(AuthError::ChallengeRejected),
            Err(e) => {
                warn!(target = %target, error = %e, "Challenge callback failed");
                ChallengeOutcome::Failed(e.to_string())
            }
        };

        Ok(Authenticated {
            claims,
            instance,
            challenge,
        })
    }

    /// Look up the claimed instance, retrying once against a fresh inventory
    async fn find_instance(&self, instance_id: &str) -> Result<Instance, AuthError> {
        if instance_id.is_empty() {
            return Err(AuthError::InstanceNotFound("<empty>".into()));
        }
        for force in [false, true] {
            match self.inventory.get(force).await {
                Ok(inv) => {
                    if let Some(inst) = inv.find_member(instance_id) {
                        return Ok(inst.clone());
                    }
                }
                Err(e) => warn!(error = %e, forced = force, "Inventory fetch failed"),
            }
        }
        Err(AuthError::InstanceNotFound(instance_id.to_string()))
    }

    /// Pick the address to challenge
    ///
    /// A DNS name from tags is used only if it resolves to one of the
    /// instance's addresses; otherwise the request's source address is used.
    async fn challenge_target(&self, instance: &Instance, source_ip: IpAddr) -> String {
        let fallback = source_ip.to_string();
        let host = match (instance.tags.get(DNS_NAME_TAG), instance.tags.get(DOMAIN_TAG)) {
            (Some(name), _) if !name.is_empty() => name.clone(),
            (_, Some(domain)) if !domain.is_empty() => {
                format!("{}.{}.agi.{}", instance.instance_id, self.region, domain)
            }
            _ => return fallback,
        };

        match self.members.resolve(&host).await {
            Ok(ips) if ips.iter().any(|ip| instance.ip.contains(&ip.to_string())) => host,
            Ok(ips) => {
                debug!(host = %host, resolved = ?ips, "DNS name does not point at instance, using IP");
                fallback
            }
            Err(e) => {
                debug!(host = %host, error = %e, "DNS lookup failed, using IP");
                fallback
            }
        }
    }
}

/// Last path segment, as GCP reports machine types as resource paths
fn last_segment(s: &str) -> &str {
    s.rsplit('/').next().unwrap_or(s)
}

/// Compare claims against the backend's instance record and the TCP source
pub fn verify_instance(
    kind: BackendKind,
    claims: &AuthClaims,
    instance: &Instance,
    source_ip: IpAddr,
) -> Result<(), AuthError> {
    let image_ok = match kind {
        BackendKind::Aws => claims.image_id == instance.image_id,
        BackendKind::Gcp => {
            !claims.image_id.is_empty()
                && instance
                    .image_id
                    .ends_with(&format!("/{}", claims.image_id))
        }
    };
    if !image_ok {
        return Err(AuthError::ImageMismatch {
            claimed: claims.image_id.clone(),
            actual: instance.image_id.clone(),
        });
    }

    if claims.private_ip.is_empty() || claims.private_ip != instance.ip.private {
        return Err(AuthError::PrivateIpMismatch {
            claimed: claims.private_ip.clone(),
            actual: instance.ip.private.clone(),
        });
    }

    if instance.zone.is_empty() || !last_segment(&claims.availability_zone).starts_with(&instance.zone)
    {
        return Err(AuthError::ZoneMismatch {
            claimed: claims.availability_zone.clone(),
            actual: instance.zone.clone(),
        });
    }

    let claimed: HashSet<&str> = claims.security_groups.iter().map(String::as_str).collect();
    let actual: HashSet<&str> = instance.firewalls.iter().map(String::as_str).collect();
    if let Some(group) = actual
        .symmetric_difference(&claimed)
        .min()
        .map(|g| g.to_string())
    {
        return Err(AuthError::SecurityGroupMismatch { group });
    }

    let type_ok = match kind {
        BackendKind::Aws => claims.instance_type == instance.instance_type,
        BackendKind::Gcp => {
            last_segment(&claims.instance_type) == last_segment(&instance.instance_type)
        }
    };
    if claims.instance_type.is_empty() || !type_ok {
        return Err(AuthError::InstanceTypeMismatch {
            claimed: claims.instance_type.clone(),
            actual: instance.instance_type.clone(),
        });
    }

    if !instance.ip.contains(&source_ip.to_string()) {
        return Err(AuthError::SourceIpMismatch {
            source_ip: source_ip.to_string(),
        });
    }

    Ok(())
}
