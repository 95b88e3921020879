//! HTTP front: event ingestion, health and metrics

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::IntoResponse,
    routing::get,
    Router,
};
use tracing::info;
use uuid::Uuid;

use crate::auth::AUTH_HEADER;
use crate::challenge::SECRET_HEADER;
use crate::monitor::{EventRequest, Monitor};

/// Largest accepted event body
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Event ingestion; the caller is identified by its TCP peer address only
async fn ingest(
    State(monitor): State<Arc<Monitor>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> impl IntoResponse {
    let tid = Uuid::new_v4();
    let body = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map(|b| b.to_vec())
        .map_err(|e| e.to_string());

    let reply = monitor
        .handle(EventRequest {
            source_ip: peer.ip(),
            auth_header: header_str(&headers, AUTH_HEADER),
            secret: header_str(&headers, SECRET_HEADER).unwrap_or_default(),
            body,
        })
        .await;

    monitor.metrics().inc_requests(reply.status.as_u16());
    info!(
        tid = %tid,
        remote_addr = %peer,
        method = %method,
        uri = %uri,
        status = reply.status.as_u16(),
        log = %reply.log,
        "Request handled"
    );

    (reply.status, reply.message)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Prometheus text exposition
async fn metrics(State(monitor): State<Arc<Monitor>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        monitor.metrics().render(),
    )
}

/// Create the monitor router
pub fn create_router(monitor: Arc<Monitor>) -> Router {
    Router::new()
        .route("/", get(ingest).post(ingest))
        .route("/agi/health", get(health))
        .route("/agi/metrics", get(metrics))
        .with_state(monitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::challenge::MemberApi;
    use crate::config::MonitorConfig;
    use crate::models::{BackendKind, Inventory};
    use crate::monitor::MonitorParts;
    use crate::notify::Notifier;
    use anyhow::Result;
    use async_trait::async_trait;
    use axum::http::Request;
    use std::net::IpAddr;
    use tower::ServiceExt;

    struct NoMembers;

    #[async_trait]
    impl MemberApi for NoMembers {
        async fn resolve(&self, _host: &str) -> Result<Vec<IpAddr>> {
            Ok(vec![])
        }
        async fn challenge(&self, _addr: &str, _secret: &str) -> Result<bool> {
            Ok(true)
        }
        async fn resize_fs(&self, _addr: &str, _secret: &str) -> Result<String> {
            Ok(String::new())
        }
    }

    fn router() -> Router {
        let config = MonitorConfig::default();
        let backend = Arc::new(MemoryBackend::new(
            BackendKind::Aws,
            Inventory::default(),
            vec![],
        ));
        let monitor = Monitor::new(
            config.clone(),
            MonitorParts {
                backend: backend.clone(),
                remote: backend,
                members: Arc::new(NoMembers),
                notifier: Notifier::new(&config.notify),
            },
        );
        create_router(Arc::new(monitor))
    }

    fn with_peer(mut req: Request<Body>) -> Request<Body> {
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([203, 0, 113, 9], 40000))));
        req
    }

    #[tokio::test]
    async fn test_health_ok() {
        let resp = router()
            .oneshot(
                Request::builder()
                    .uri("/agi/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_missing_auth_header_is_401() {
        let resp = router()
            .oneshot(with_peer(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .body(Body::from("{}"))
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"auth header missing");
    }

    #[tokio::test]
    async fn test_metrics_exposed() {
        let resp = router()
            .oneshot(
                Request::builder()
                    .uri("/agi/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
