//! The monitor service
//!
//! Owns the ban tracker, inventory cache, authenticator, sizing engine and
//! orchestrator, and turns one inbound event request into one reply.

use std::net::IpAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use tracing::{debug, info, warn};

use crate::auth::{Authenticated, Authenticator};
use crate::backend::{Backend, RemoteExec};
use crate::ban::IpBanTracker;
use crate::challenge::MemberApi;
use crate::config::MonitorConfig;
use crate::error::AuthError;
use crate::inventory::InventoryCache;
use crate::models::{Event, EventKind};
use crate::notify::Notifier;
use crate::observability::{MonitorMetrics, StructuredLogger};
use crate::orchestrator::{Orchestrator, OrchestratorDeps, SizingJob};
use crate::sizing::{SizingEngine, SizingPath};

/// One inbound event request, already separated from the transport
#[derive(Debug, Clone)]
pub struct EventRequest {
    pub source_ip: IpAddr,
    pub auth_header: Option<String>,
    pub secret: String,
    /// Body bytes, or the read error
    pub body: Result<Vec<u8>, String>,
}

/// Reply to a member plus the detailed line for the access log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: StatusCode,
    pub message: String,
    pub log: String,
}

impl Reply {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status,
            log: message.clone(),
            message,
        }
    }

    fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = log.into();
        self
    }
}

/// Collaborators the monitor is built from
pub struct MonitorParts {
    pub backend: Arc<dyn Backend>,
    pub remote: Arc<dyn RemoteExec>,
    pub members: Arc<dyn MemberApi>,
    pub notifier: Notifier,
}

/// Long-lived service shared by every request
pub struct Monitor {
    config: MonitorConfig,
    bans: Arc<IpBanTracker>,
    auth: Authenticator,
    backend: Arc<dyn Backend>,
    sizing: SizingEngine,
    orchestrator: Arc<Orchestrator>,
    metrics: MonitorMetrics,
    logger: StructuredLogger,
}

impl Monitor {
    pub fn new(config: MonitorConfig, parts: MonitorParts) -> Self {
        let metrics = MonitorMetrics::new();
        let logger = StructuredLogger::new(&config.listen_address);
        let inventory = Arc::new(InventoryCache::new(parts.backend.clone(), metrics.clone()));
        let kind = parts.backend.kind();

        let auth = Authenticator::new(
            inventory.clone(),
            parts.members.clone(),
            kind,
            config.region.clone(),
        );
        let orchestrator = Arc::new(Orchestrator::new(OrchestratorDeps {
            backend: parts.backend.clone(),
            remote: parts.remote,
            members: parts.members,
            inventory,
            notifier: parts.notifier,
            metrics: metrics.clone(),
            logger: logger.clone(),
        }));

        Self {
            sizing: SizingEngine::new(config.sizing.clone(), kind),
            bans: Arc::new(IpBanTracker::new().with_metrics(metrics.clone())),
            auth,
            backend: parts.backend,
            orchestrator,
            metrics,
            logger,
            config,
        }
    }

    pub fn bans(&self) -> Arc<IpBanTracker> {
        self.bans.clone()
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn metrics(&self) -> &MonitorMetrics {
        &self.metrics
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    /// Authenticate, parse and route one event
    pub async fn handle(&self, req: EventRequest) -> Reply {
        let ip = req.source_ip;
        if self.bans.is_banned(ip) {
            return Reply::new(StatusCode::FORBIDDEN, "banned");
        }

        let authenticated = match self
            .auth
            .authenticate(req.auth_header.as_deref(), &req.secret, ip)
            .await
        {
            Ok(a) => a,
            Err(e) => return self.auth_failure(ip, e),
        };

        let body = match req.body {
            Ok(body) => body,
            Err(e) => {
                return Reply::new(StatusCode::BAD_REQUEST, "message body read error")
                    .with_log(format!("message body read error: {e}"))
            }
        };
        let event: Event = match serde_json::from_slice(&body) {
            Ok(event) => event,
            Err(e) => {
                return Reply::new(StatusCode::BAD_REQUEST, "message json malformed")
                    .with_log(format!("message json malformed: {e}"))
            }
        };

        if self.config.debug_events {
            match serde_json::to_string_pretty(&event) {
                Ok(pretty) => info!(event = %pretty, "Event received"),
                Err(e) => debug!(error = %e, "Failed to render event"),
            }
        }

        match &event.event {
            EventKind::SpotNoCapacity => self.capacity(event, &authenticated, ip),
            kind if kind.triggers_sizing() => {
                self.check_sizing(event, &authenticated, &req.secret, ip)
                    .await
            }
            _ => Reply::new(StatusCode::OK, "event received"),
        }
    }

    fn auth_failure(&self, ip: IpAddr, err: AuthError) -> Reply {
        self.metrics.inc_auth_failures(err.metric_label());
        if err.counts_toward_ban() && self.bans.report_failure(ip) {
            self.logger.log_ban(&ip.to_string(), err.public_reason());
        }
        Reply::new(StatusCode::UNAUTHORIZED, err.public_reason()).with_log(err.to_string())
    }

    /// Remediation needs the challenge to have gone through
    fn require_challenge(&self, ip: IpAddr, auth: &Authenticated) -> Option<Reply> {
        auth.require_challenge()
            .err()
            .map(|e| self.auth_failure(ip, e))
    }

    fn capacity(&self, event: Event, auth: &Authenticated, ip: IpAddr) -> Reply {
        if self.config.capacity.disable {
            return Reply::new(StatusCode::OK, "ignoring: capacity handling disabled");
        }
        if let Some(reply) = self.require_challenge(ip, auth) {
            return reply;
        }
        if let Err(e) = event.deployment() {
            return Reply::new(StatusCode::BAD_REQUEST, "capacity: invalid deployment json")
                .with_log(format!("capacity: invalid deployment json: {e}"));
        }

        let name = event.agi_name.clone();
        let queued = self.orchestrator.spawn_capacity(event);
        Reply::new(StatusCode::IM_A_TEAPOT, "capacity: rotating to on-demand").with_log(format!(
            "capacity: rotating {name} to on-demand (queued={queued})"
        ))
    }

    async fn check_sizing(
        &self,
        event: Event,
        auth: &Authenticated,
        secret: &str,
        ip: IpAddr,
    ) -> Reply {
        if self.config.sizing.disable {
            return Reply::new(StatusCode::OK, "ignoring: sizing disabled");
        }
        if let Some(reply) = self.require_challenge(ip, auth) {
            return reply;
        }

        let instance_type = auth.instance.instance_type.as_str();
        let current_type = instance_type.rsplit('/').next().unwrap_or(instance_type);

        let catalog = if self.sizing.needs_catalog(&event) {
            match self.backend.get_instance_types().await {
                Ok(catalog) => Some(catalog),
                Err(e) => {
                    warn!(error = %e, "Failed to fetch instance types");
                    None
                }
            }
        } else {
            None
        };

        let decision = match self
            .sizing
            .decide(&event, current_type, catalog.as_deref())
        {
            Ok(decision) => decision,
            Err(rejection) => {
                let status =
                    StatusCode::from_u16(rejection.status).unwrap_or(StatusCode::BAD_REQUEST);
                return Reply::new(status, rejection.reason);
            }
        };

        let path = decision.path();
        if path == SizingPath::None {
            return Reply::new(StatusCode::OK, "sizing: not required");
        }
        if let Err(e) = event.deployment() {
            return Reply::new(StatusCode::BAD_REQUEST, "sizing: invalid deployment json")
                .with_log(format!("sizing: invalid deployment json: {e}"));
        }

        let name = event.agi_name.clone();
        let queued = self.orchestrator.spawn_sizing(SizingJob {
            event,
            decision: decision.clone(),
            secret: secret.to_string(),
            member_addr: ip.to_string(),
        });
        let reply = match path {
            SizingPath::DiskOnly => Reply::new(StatusCode::OK, "sizing: adding disk capacity"),
            SizingPath::RamOnly => Reply::new(StatusCode::IM_A_TEAPOT, "sizing: instance-ram"),
            _ => Reply::new(StatusCode::IM_A_TEAPOT, "sizing: instance-disk-and-ram"),
        };
        let log = format!("{} member={name} decision={decision:?} queued={queued}", reply.message);
        reply.with_log(log)
    }
}
