//! AGI Monitor - fleet autoscaling and remediation service
//!
//! Receives events from AGI members, authenticates them, and resizes or
//! rotates members when they run short of RAM, disk or spot capacity.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use monitor_lib::{
    ban::SWEEP_INTERVAL, config::LogFormat, ExecBackend, HttpMemberApi, Monitor, MonitorParts,
    Notifier,
};
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod tls;

const MONITOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bound on waiting for running jobs and notifications at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15 * 60);

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty())
            .init(),
    }
}

async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT received",
                _ = term.recv() => "SIGTERM received",
            },
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT received"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT received"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load()?;
    init_tracing(config.log_format);

    info!(
        listen = %config.listen_address,
        backend = %config.backend_type,
        "Starting agi-monitor"
    );

    let acceptor = tls::acceptor(&config.tls).context("failed to set up TLS")?;
    let members = HttpMemberApi::new(config.strict_member_tls)
        .context("failed to build member client")?
        .with_port(config.member_port);
    let backend = Arc::new(ExecBackend::new(&config.fleet.binary, config.backend_type));
    let notifier = Notifier::new(&config.notify);
    if !notifier.is_enabled() {
        info!("No notification channel configured");
    }

    let monitor = Arc::new(Monitor::new(
        config.clone(),
        MonitorParts {
            backend: backend.clone(),
            remote: backend,
            members: Arc::new(members),
            notifier,
        },
    ));
    let logger = monitor.logger().clone();
    logger.log_startup(
        MONITOR_VERSION,
        &config.backend_type.to_string(),
        &format!("{:?}", config.tls.mode),
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let sweep = tokio::spawn(
        monitor
            .bans()
            .run_sweep(SWEEP_INTERVAL, shutdown_tx.subscribe()),
    );
    let listen_address = config.listen_address.clone();
    let mut server = tokio::spawn({
        let monitor = monitor.clone();
        let shutdown = shutdown_tx.subscribe();
        async move { api::serve(&listen_address, acceptor, monitor, shutdown).await }
    });

    let failure = tokio::select! {
        reason = shutdown_signal() => {
            logger.log_shutdown(reason);
            None
        }
        res = &mut server => Some(res),
    };

    let _ = shutdown_tx.send(());
    let _ = sweep.await;

    let result = match failure {
        Some(res) => res.context("listener task panicked")?,
        None => server.await.context("listener task panicked")?,
    };
    if let Err(e) = &result {
        error!(error = %e, "Listener failed");
        logger.log_shutdown("listener failed");
    }

    monitor.orchestrator().wait_idle(SHUTDOWN_GRACE).await;
    info!("Shutdown complete");
    result
}
