//! Per-IP abuse tracking
//!
//! Failures are counted in a rolling window; crossing the threshold bans the
//! address. A banned address that keeps probing keeps its ban alive.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::observability::MonitorMetrics;

/// Rolling window for counting failures
pub const FAILURE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Failures within the window that trigger a ban
pub const FAILURE_THRESHOLD: usize = 5;

/// Ban length, refreshed on every banned attempt
pub const BAN_DURATION: Duration = Duration::from_secs(60 * 60);

/// Interval of the background sweep
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct BanState {
    failures: HashMap<IpAddr, Vec<Instant>>,
    bans: HashMap<IpAddr, Instant>,
}

/// Sliding-window failure counter and ban list
#[derive(Debug, Default)]
pub struct IpBanTracker {
    state: Mutex<BanState>,
    metrics: Option<MonitorMetrics>,
}

impl IpBanTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count bans on the process metrics
    pub fn with_metrics(mut self, metrics: MonitorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BanState> {
        // A panic while holding the lock leaves plain maps behind, still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether `ip` is banned. A hit pushes the expiry forward.
    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.is_banned_at(ip, Instant::now())
    }

    pub fn is_banned_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut state = self.lock();
        match state.bans.get(&ip).copied() {
            Some(expiry) if expiry > now => {
                state.bans.insert(ip, now + BAN_DURATION);
                true
            }
            Some(_) => {
                state.bans.remove(&ip);
                false
            }
            None => false,
        }
    }

    /// Record one failure; returns true when the address should now be banned
    pub fn record_failure(&self, ip: IpAddr) -> bool {
        self.record_failure_at(ip, Instant::now())
    }

    pub fn record_failure_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut state = self.lock();
        let failures = state.failures.entry(ip).or_default();
        failures.retain(|t| now.saturating_duration_since(*t) < FAILURE_WINDOW);
        failures.push(now);
        failures.len() >= FAILURE_THRESHOLD
    }

    pub fn ban(&self, ip: IpAddr) {
        self.ban_at(ip, Instant::now());
    }

    pub fn ban_at(&self, ip: IpAddr, now: Instant) {
        let mut state = self.lock();
        state.bans.insert(ip, now + BAN_DURATION);
        state.failures.remove(&ip);
        if let Some(metrics) = &self.metrics {
            metrics.inc_bans();
        }
    }

    /// Record a failure and ban when the threshold is reached.
    /// Returns true if this call banned the address.
    pub fn report_failure(&self, ip: IpAddr) -> bool {
        self.report_failure_at(ip, Instant::now())
    }

    pub fn report_failure_at(&self, ip: IpAddr, now: Instant) -> bool {
        if self.record_failure_at(ip, now) {
            self.ban_at(ip, now);
            return true;
        }
        false
    }

    /// Drop expired bans and failure lists with nothing left in the window
    pub fn cleanup(&self) {
        self.cleanup_at(Instant::now());
    }

    pub fn cleanup_at(&self, now: Instant) {
        let mut state = self.lock();
        state.bans.retain(|ip, expiry| {
            if *expiry <= now {
                info!(ip = %ip, "IP ban expired, removing");
                false
            } else {
                true
            }
        });
        state.failures.retain(|_, failures| {
            failures.retain(|t| now.saturating_duration_since(*t) < FAILURE_WINDOW);
            !failures.is_empty()
        });
    }

    /// Number of tracked addresses, banned and failing
    pub fn tracked(&self) -> (usize, usize) {
        let state = self.lock();
        (state.bans.len(), state.failures.len())
    }

    /// Run `cleanup` every `interval` until shutdown fires
    pub async fn run_sweep(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cleanup();
                    let (bans, failing) = self.tracked();
                    debug!(bans, failing, "Ban sweep complete");
                }
                _ = shutdown.recv() => {
                    info!("Ban sweep stopping");
                    break;
                }
            }
        }
    }
}

const HANDSHAKE_PREFIX: &str = "TLS handshake error from ";

/// Extract the peer address from a handshake failure log line
pub fn parse_handshake_error(line: &str) -> Option<IpAddr> {
    let rest = &line[line.find(HANDSHAKE_PREFIX)? + HANDSHAKE_PREFIX.len()..];
    let addr = rest.split(|c: char| c == ' ' || c == ',').next()?;
    let addr = addr.strip_suffix(':').unwrap_or(addr);
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        return Some(sock.ip());
    }
    addr.parse::<IpAddr>().ok()
}

/// Sink for TLS listener error lines
///
/// Lines matching the handshake failure pattern count toward banning the
/// peer, even though those connections never reach the HTTP handler.
#[derive(Clone)]
pub struct HandshakeErrorLog {
    tracker: Arc<IpBanTracker>,
}

impl HandshakeErrorLog {
    pub fn new(tracker: Arc<IpBanTracker>) -> Self {
        Self { tracker }
    }

    /// Format and consume a failed handshake
    pub fn handshake_failed(&self, peer: SocketAddr, err: &dyn std::fmt::Display) {
        self.write_line(&format!("{HANDSHAKE_PREFIX}{peer}: {err}"));
    }

    pub fn write_line(&self, line: &str) {
        let line = line.trim_end();
        debug!(line = %line, "TLS listener error");
        let Some(ip) = parse_handshake_error(line) else {
            return;
        };
        if self.tracker.report_failure(ip) {
            warn!(ip = %ip, "IP banned for 1 hour due to repeated TLS handshake failures");
        }
    }
}
