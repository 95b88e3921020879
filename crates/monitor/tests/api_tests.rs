//! Integration tests for the monitor HTTP front

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    extract::ConnectInfo,
    http::{Request, StatusCode},
    Router,
};
use monitor_lib::{
    backend::{BackendCall, MemoryBackend},
    create_router, encode_gzip_b64, AuthClaims, BackendKind, Event, EventKind, IngestProgress,
    IngestStatus, Instance, InstanceIps, InstanceType, Inventory, MemberApi, Monitor,
    MonitorConfig, MonitorParts, Notifier, SystemSnapshot, AUTH_HEADER, GIB, SECRET_HEADER,
};
use tower::ServiceExt;

const SECRET: &str = "s3cret";
const MEMBER_IP: [u8; 4] = [54, 1, 2, 3];

/// Member endpoint that accepts only the expected secret
struct FakeMembers;

#[async_trait]
impl MemberApi for FakeMembers {
    async fn resolve(&self, _host: &str) -> Result<Vec<IpAddr>> {
        Ok(vec![])
    }

    async fn challenge(&self, _addr: &str, secret: &str) -> Result<bool> {
        Ok(secret == SECRET)
    }

    async fn resize_fs(&self, _addr: &str, _secret: &str) -> Result<String> {
        Ok("resized".into())
    }
}

fn member() -> Instance {
    Instance {
        instance_id: "i-0abc".into(),
        name: "agi-1".into(),
        kind: "agi".into(),
        zone: "us-east-1a".into(),
        image_id: "ami-123".into(),
        instance_type: "r6a.xlarge".into(),
        ip: InstanceIps {
            public: "54.1.2.3".into(),
            private: "10.0.0.5".into(),
        },
        tags: HashMap::new(),
        firewalls: vec!["agi-sg".into()],
        owner: "ops".into(),
    }
}

fn claims_for(inst: &Instance) -> String {
    AuthClaims {
        account_project_id: "1234".into(),
        availability_zone: inst.zone.clone(),
        image_id: inst.image_id.clone(),
        instance_id: inst.instance_id.clone(),
        instance_type: inst.instance_type.clone(),
        private_ip: inst.ip.private.clone(),
        security_groups: inst.firewalls.clone(),
    }
    .encode()
}

fn catalog() -> Vec<InstanceType> {
    [
        ("r6a.large", 16.0),
        ("r6a.xlarge", 32.0),
        ("r6a.2xlarge", 64.0),
        ("r6a.4xlarge", 128.0),
        ("r6a.8xlarge", 256.0),
    ]
    .into_iter()
    .map(|(name, gib)| InstanceType {
        name: name.into(),
        memory_gib: gib,
        cpus: 4,
    })
    .collect()
}

struct TestApp {
    router: Router,
    monitor: Arc<Monitor>,
    backend: Arc<MemoryBackend>,
}

fn setup(config: MonitorConfig, inst: Instance) -> TestApp {
    let backend = Arc::new(MemoryBackend::new(
        BackendKind::Aws,
        Inventory {
            instances: vec![inst],
            volumes: vec![],
        },
        catalog(),
    ));
    let monitor = Arc::new(Monitor::new(
        config.clone(),
        MonitorParts {
            backend: backend.clone(),
            remote: backend.clone(),
            members: Arc::new(FakeMembers),
            notifier: Notifier::new(&config.notify),
        },
    ));
    TestApp {
        router: create_router(monitor.clone()),
        monitor,
        backend,
    }
}

fn event(kind: EventKind) -> Event {
    Event {
        agi_name: "agi-1".into(),
        event: kind,
        owner: "ops".into(),
        deployment_json_gz_b64: encode_gzip_b64(br#"{"ClusterName":"agi-1","NoDIM":false}"#),
        ..Default::default()
    }
}

fn post(auth: Option<&str>, secret: &str, body: impl Into<Body>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/")
        .header(SECRET_HEADER, secret);
    if let Some(auth) = auth {
        builder = builder.header(AUTH_HEADER, auth);
    }
    let mut req = builder.body(body.into()).unwrap();
    req.extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((MEMBER_IP, 51000))));
    req
}

fn post_event(ev: &Event, secret: &str) -> Request<Body> {
    post(
        Some(&claims_for(&member())),
        secret,
        serde_json::to_vec(ev).unwrap(),
    )
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, String) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
    (status, String::from_utf8_lossy(&body).into_owned())
}

fn destroys(backend: &MemoryBackend) -> usize {
    backend
        .mutations()
        .iter()
        .filter(|c| matches!(c, BackendCall::Destroy { .. }))
        .count()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = setup(MonitorConfig::default(), member());
    let req = Request::builder()
        .uri("/agi/health")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn test_missing_auth_header_rejected() {
    let app = setup(MonitorConfig::default(), member());
    let (status, body) = send(&app.router, post(None, SECRET, "{}")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, "auth header missing");
}

#[tokio::test]
async fn test_repeated_bad_headers_ban_source() {
    let app = setup(MonitorConfig::default(), member());
    for _ in 0..5 {
        let (status, body) = send(&app.router, post(Some("%%%"), SECRET, "{}")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, "auth header invalid json");
    }

    // Even a valid request is refused while banned.
    let (status, body) = send(&app.router, post_event(&event(EventKind::InitComplete), SECRET)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, "banned");
}

#[tokio::test]
async fn test_unknown_instance_does_not_ban() {
    let app = setup(MonitorConfig::default(), member());
    let stranger = Instance {
        instance_id: "i-unknown".into(),
        ..member()
    };
    for _ in 0..6 {
        let (status, body) = send(
            &app.router,
            post(Some(&claims_for(&stranger)), SECRET, "{}"),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, "auth: instance not found");
    }
    assert!(!app.monitor.bans().is_banned(IpAddr::from(MEMBER_IP)));
}

#[tokio::test]
async fn test_informational_event_acknowledged() {
    let app = setup(MonitorConfig::default(), member());
    let ev = event(EventKind::Other("SOMETHING_NEW".into()));
    let (status, body) = send(&app.router, post_event(&ev, SECRET)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "event received");
}

#[tokio::test]
async fn test_malformed_json_rejected() {
    let app = setup(MonitorConfig::default(), member());
    let (status, body) = send(
        &app.router,
        post(Some(&claims_for(&member())), SECRET, "{not json"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "message json malformed");
}

#[tokio::test]
async fn test_wrong_secret_blocks_remediation() {
    let app = setup(MonitorConfig::default(), member());
    let (status, body) = send(
        &app.router,
        post_event(&event(EventKind::SpotNoCapacity), "wrong"),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, "auth: incorrect");
    app.monitor
        .orchestrator()
        .wait_idle(Duration::from_secs(5))
        .await;
    assert_eq!(destroys(&app.backend), 0);
}

/// Memory pressure on the largest type the RAM cap allows
#[tokio::test]
async fn test_scenario_a_exhausted_sizing_rejected() {
    let inst = Instance {
        instance_type: "r6a.4xlarge".into(),
        ..member()
    };
    let app = setup(MonitorConfig::default(), inst.clone());

    let mut ev = event(EventKind::ResourceMonitor);
    ev.is_data_in_memory = false;
    ev.ingest_status = IngestStatus {
        database_running: true,
        plugin_running: true,
        system: SystemSnapshot {
            memory_total_bytes: 128 * GIB,
            memory_free_bytes: 2 * GIB,
            ..Default::default()
        },
        ..Default::default()
    };

    let req = post(
        Some(&claims_for(&inst)),
        SECRET,
        serde_json::to_vec(&ev).unwrap(),
    );
    let (status, body) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.starts_with("sizing: "), "{body}");
    assert!(body.contains("r6a.4xlarge"), "{body}");

    app.monitor
        .orchestrator()
        .wait_idle(Duration::from_secs(5))
        .await;
    assert!(app.backend.mutations().is_empty());
}

#[tokio::test]
async fn test_scenario_b_capacity_disabled() {
    let mut config = MonitorConfig::default();
    config.capacity.disable = true;
    let app = setup(config, member());

    let (status, body) = send(
        &app.router,
        post_event(&event(EventKind::SpotNoCapacity), SECRET),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ignoring: capacity handling disabled");

    app.monitor
        .orchestrator()
        .wait_idle(Duration::from_secs(5))
        .await;
    assert_eq!(destroys(&app.backend), 0);
}

#[tokio::test]
async fn test_scenario_c_preprocess_disables_dim_first() {
    let mut config = MonitorConfig::default();
    config.sizing.no_dim_first = true;
    let app = setup(config, member());

    let mut ev = event(EventKind::PreProcessComplete);
    ev.is_data_in_memory = true;
    ev.ingest_status = IngestStatus {
        ingest: IngestProgress {
            log_processor_total_size: (50 * GIB) as i64,
            ..Default::default()
        },
        ..Default::default()
    };

    let (status, body) = send(&app.router, post_event(&ev, SECRET)).await;
    assert_eq!(status, StatusCode::IM_A_TEAPOT);
    assert_eq!(body, "sizing: instance-ram");

    app.monitor
        .orchestrator()
        .wait_idle(Duration::from_secs(5))
        .await;
    let start = app
        .backend
        .mutations()
        .into_iter()
        .find_map(|c| match c {
            BackendCall::Start { overrides, .. } => Some(overrides),
            _ => None,
        })
        .expect("member restarted");
    assert_eq!(start.no_dim, Some(true));
    assert_eq!(start.instance_type.as_deref(), Some("r6a.xlarge"));
}

#[tokio::test]
async fn test_spot_capacity_rotates_to_on_demand() {
    let app = setup(MonitorConfig::default(), member());
    let (status, body) = send(
        &app.router,
        post_event(&event(EventKind::SpotNoCapacity), SECRET),
    )
    .await;
    assert_eq!(status, StatusCode::IM_A_TEAPOT);
    assert_eq!(body, "capacity: rotating to on-demand");

    app.monitor
        .orchestrator()
        .wait_idle(Duration::from_secs(5))
        .await;
    let calls = app.backend.mutations();
    assert_eq!(destroys(&app.backend), 1);
    assert!(calls.iter().any(|c| matches!(
        c,
        BackendCall::Start { name, overrides } if name == "agi-1" && overrides.spot == Some(false)
    )));
}

#[tokio::test]
async fn test_sizing_disabled_ignores_pressure() {
    let mut config = MonitorConfig::default();
    config.sizing.disable = true;
    let app = setup(config, member());

    let mut ev = event(EventKind::ResourceMonitor);
    ev.ingest_status.system = SystemSnapshot {
        memory_total_bytes: 32 * GIB,
        memory_free_bytes: GIB,
        ..Default::default()
    };
    let (status, body) = send(&app.router, post_event(&ev, SECRET)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ignoring: sizing disabled");
}

#[tokio::test]
async fn test_quiet_resource_monitor_needs_nothing() {
    let app = setup(MonitorConfig::default(), member());
    let mut ev = event(EventKind::ResourceMonitor);
    ev.ingest_status.system = SystemSnapshot {
        memory_total_bytes: 32 * GIB,
        memory_free_bytes: 20 * GIB,
        ..Default::default()
    };
    let (status, body) = send(&app.router, post_event(&ev, SECRET)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "sizing: not required");
}
