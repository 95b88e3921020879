//! Observability infrastructure for the monitor
//!
//! Provides:
//! - Prometheus metrics (responses, auth failures, bans, remediation stages, inventory latency)
//! - Structured logging of lifecycle and remediation events with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Encoder, Histogram,
    IntCounter, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Buckets for inventory refresh latency (in seconds); the fleet CLI is slow
const REFRESH_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<MonitorMetricsInner> = OnceLock::new();

struct MonitorMetricsInner {
    requests_total: IntCounterVec,
    auth_failures_total: IntCounterVec,
    bans_total: IntCounter,
    actions_total: IntCounterVec,
    inventory_refresh_seconds: Histogram,
}

impl MonitorMetricsInner {
    fn new() -> Self {
        Self {
            requests_total: register_int_counter_vec!(
                "agi_monitor_requests_total",
                "Event requests answered, by response code",
                &["code"]
            )
            .expect("Failed to register requests_total"),

            auth_failures_total: register_int_counter_vec!(
                "agi_monitor_auth_failures_total",
                "Authentication failures, by reason",
                &["reason"]
            )
            .expect("Failed to register auth_failures_total"),

            bans_total: register_int_counter!(
                "agi_monitor_bans_total",
                "Source addresses banned"
            )
            .expect("Failed to register bans_total"),

            actions_total: register_int_counter_vec!(
                "agi_monitor_actions_total",
                "Remediation job stage transitions",
                &["action", "stage"]
            )
            .expect("Failed to register actions_total"),

            inventory_refresh_seconds: register_histogram!(
                "agi_monitor_inventory_refresh_seconds",
                "Time spent refreshing the fleet inventory",
                REFRESH_BUCKETS.to_vec()
            )
            .expect("Failed to register inventory_refresh_seconds"),
        }
    }
}

/// Monitor metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share it.
#[derive(Clone, Debug)]
pub struct MonitorMetrics {
    _private: (),
}

impl Default for MonitorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(MonitorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &MonitorMetricsInner {
        GLOBAL_METRICS.get_or_init(MonitorMetricsInner::new)
    }

    pub fn inc_requests(&self, code: u16) {
        self.inner()
            .requests_total
            .with_label_values(&[&code.to_string()])
            .inc();
    }

    pub fn inc_auth_failures(&self, reason: &str) {
        self.inner()
            .auth_failures_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn inc_bans(&self) {
        self.inner().bans_total.inc();
    }

    pub fn inc_action(&self, action: &str, stage: &str) {
        self.inner()
            .actions_total
            .with_label_values(&[action, stage])
            .inc();
    }

    pub fn observe_inventory_refresh(&self, duration_secs: f64) {
        self.inner().inventory_refresh_seconds.observe(duration_secs);
    }

    /// Render the default registry in text exposition format
    pub fn render(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
        }
        buffer
    }
}

/// Structured logger for monitor lifecycle and remediation events
///
/// Every line carries an `event` field so log pipelines can filter on it.
#[derive(Clone)]
pub struct StructuredLogger {
    listen_address: String,
}

impl StructuredLogger {
    pub fn new(listen_address: impl Into<String>) -> Self {
        Self {
            listen_address: listen_address.into(),
        }
    }

    pub fn log_startup(&self, version: &str, backend: &str, tls_mode: &str) {
        info!(
            event = "monitor_started",
            listen = %self.listen_address,
            version = %version,
            backend = %backend,
            tls_mode = %tls_mode,
            "AGI monitor started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "monitor_shutdown",
            listen = %self.listen_address,
            reason = %reason,
            "AGI monitor shutting down"
        );
    }

    /// Log an address being banned
    pub fn log_ban(&self, ip: &str, cause: &str) {
        warn!(
            event = "ip_banned",
            ip = %ip,
            cause = %cause,
            "IP banned for 1 hour"
        );
    }

    /// Log a remediation job stage transition
    pub fn log_action_stage(&self, action: &str, stage: &str, member: &str, err: Option<&str>) {
        match err {
            Some(err) => error!(
                event = "action_stage",
                action = %action,
                stage = %stage,
                member = %member,
                error = %err,
                "Remediation failed"
            ),
            None => info!(
                event = "action_stage",
                action = %action,
                stage = %stage,
                member = %member,
                "Remediation stage"
            ),
        }
    }

    /// Log a refused destructive action
    pub fn log_critical(&self, action: &str, reason: &str) {
        error!(
            event = "safety_violation",
            action = %action,
            reason = %reason,
            "CRITICAL: refusing destructive action"
        );
    }
}
