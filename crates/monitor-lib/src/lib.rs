//! Monitor library for AGI fleet remediation
//!
//! This crate provides the core functionality for:
//! - Authenticating member events and banning abusive sources
//! - Sizing decisions for RAM and disk
//! - Destroy-and-recreate and volume resize orchestration
//! - Operator notifications
//! - The HTTP front and observability

pub mod auth;
pub mod backend;
pub mod ban;
pub mod challenge;
pub mod config;
pub mod error;
pub mod http;
pub mod inventory;
pub mod models;
pub mod monitor;
pub mod notify;
pub mod observability;
pub mod orchestrator;
pub mod sizing;

pub use auth::{Authenticated, Authenticator, ChallengeOutcome, AUTH_HEADER};
pub use backend::{Backend, ExecBackend, RemoteExec, StartOverrides};
pub use ban::{HandshakeErrorLog, IpBanTracker};
pub use challenge::{HttpMemberApi, MemberApi, SECRET_HEADER};
pub use config::{MonitorConfig, TlsMode};
pub use error::{AuthError, DecodeError, OrchestrationError, SizingError};
pub use http::create_router;
pub use inventory::InventoryCache;
pub use models::*;
pub use monitor::{EventRequest, Monitor, MonitorParts, Reply};
pub use notify::Notifier;
pub use observability::{MonitorMetrics, StructuredLogger};
pub use orchestrator::Orchestrator;
pub use sizing::{SizingDecision, SizingEngine, SizingPath};
