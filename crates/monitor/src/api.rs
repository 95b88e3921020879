//! Listener for the monitor's HTTP front, plain or TLS

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{extract::ConnectInfo, Router};
use hyper::{body::Incoming, Request};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use monitor_lib::{create_router, HandshakeErrorLog, Monitor};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::{server::TlsStream, TlsAcceptor};
use tower::ServiceExt;
use tracing::{debug, info};

/// Peers must complete the TLS handshake within this window
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Serve until shutdown fires
pub async fn serve(
    listen_address: &str,
    acceptor: Option<TlsAcceptor>,
    monitor: Arc<Monitor>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let app = create_router(monitor.clone());
    let listener = TcpListener::bind(listen_address)
        .await
        .with_context(|| format!("failed to bind {listen_address}"))?;
    info!(addr = %listen_address, tls = acceptor.is_some(), "Starting monitor listener");

    let Some(acceptor) = acceptor else {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
        return Ok(());
    };

    let handshake_log = HandshakeErrorLog::new(monitor.bans());
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(error = %e, "Accept failed");
                    continue;
                }
            },
            _ = shutdown.recv() => break,
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        let handshake_log = handshake_log.clone();
        tokio::spawn(async move {
            let Some(tls) =
                accept_tls(&acceptor, stream, peer, &handshake_log, HANDSHAKE_TIMEOUT).await
            else {
                return;
            };
            serve_connection(TokioIo::new(tls), peer, app).await;
        });
    }

    info!("Monitor listener stopped");
    Ok(())
}

/// TLS handshake bounded by `limit`; failures and stalls are reported to the ban log
async fn accept_tls<IO>(
    acceptor: &TlsAcceptor,
    stream: IO,
    peer: SocketAddr,
    handshake_log: &HandshakeErrorLog,
    limit: Duration,
) -> Option<TlsStream<IO>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(limit, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => Some(tls),
        Ok(Err(e)) => {
            handshake_log.handshake_failed(peer, &e);
            None
        }
        Err(elapsed) => {
            handshake_log.handshake_failed(peer, &elapsed);
            None
        }
    }
}

/// Serve one accepted connection, tagging requests with the peer address
async fn serve_connection<I>(io: TokioIo<I>, peer: SocketAddr, app: Router)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |mut req: Request<Incoming>| {
        req.extensions_mut().insert(ConnectInfo(peer));
        app.clone().oneshot(req)
    });
    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
    {
        debug!(peer = %peer, error = %e, "Connection closed with error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use monitor_lib::IpBanTracker;
    use rustls::ServerConfig;

    fn test_acceptor() -> TlsAcceptor {
        let (certs, key) = crate::tls::generate_self_signed().unwrap();
        let server = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .unwrap();
        TlsAcceptor::from(Arc::new(server))
    }

    #[tokio::test]
    async fn test_stalled_handshakes_time_out_and_ban() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tracker = Arc::new(IpBanTracker::new());
        let handshake_log = HandshakeErrorLog::new(tracker.clone());
        let acceptor = test_acceptor();

        let mut idle = Vec::new();
        for _ in 0..5 {
            // Connected, but never sends a ClientHello.
            idle.push(tokio::net::TcpStream::connect(addr).await.unwrap());
            let (stream, peer) = listener.accept().await.unwrap();
            let tls = accept_tls(
                &acceptor,
                stream,
                peer,
                &handshake_log,
                Duration::from_millis(50),
            )
            .await;
            assert!(tls.is_none());
        }
        assert!(tracker.is_banned(addr.ip()));
    }
}
