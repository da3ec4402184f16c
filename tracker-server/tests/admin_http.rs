use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::Value;

use health::HealthRegistry;
use tracker_common::liveness::DeviceLiveness;
use tracker_common::rawlog::RawLog;
use tracker_server::admin::{router, AdminState};

struct AdminApp {
    addr: SocketAddr,
    liveness: Arc<DeviceLiveness>,
    rawlog: Arc<RawLog>,
    registry: HealthRegistry,
}

impl AdminApp {
    fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.addr, path_and_query)
    }
}

async fn spawn_admin() -> AdminApp {
    let liveness = Arc::new(DeviceLiveness::new());
    let rawlog = Arc::new(RawLog::new());
    let registry = HealthRegistry::new("liveness");
    // A local recorder keeps tests independent of the process-global one.
    let metrics = PrometheusBuilder::new().build_recorder().handle();

    let state = AdminState {
        liveness: liveness.clone(),
        rawlog: rawlog.clone(),
        online_threshold: Duration::from_millis(120_000),
    };
    let app = router(state, registry.clone(), metrics);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().expect("failed to read local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("admin server quit");
    });

    AdminApp {
        addr,
        liveness,
        rawlog,
        registry,
    }
}

#[tokio::test]
async fn index_identifies_the_service() {
    let app = spawn_admin().await;
    let response = reqwest::get(app.url("/")).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "tracker");
}

#[tokio::test]
async fn liveness_follows_component_reports() {
    let app = spawn_admin().await;

    // Nothing has registered yet, the process is not ready for traffic.
    let response = reqwest::get(app.url("/_liveness")).await.unwrap();
    assert_eq!(response.status().as_u16(), 500);

    let handle = app
        .registry
        .register("gt06".to_string(), time::Duration::seconds(30))
        .await;
    handle.report_healthy().await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let response = reqwest::get(app.url("/_liveness")).await.unwrap();
        if response.status().as_u16() == 200 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "liveness never went healthy"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn rawlog_filters_by_port_and_limit() {
    let app = spawn_admin().await;
    app.rawlog
        .push(5051, Some("10.0.0.1:40001".to_string()), "787808".to_string());
    app.rawlog.push(5055, None, "GET /?id=abc".to_string());
    app.rawlog
        .push(5051, Some("10.0.0.1:40001".to_string()), "0d0a".to_string());

    let all: Value = reqwest::get(app.url("/_rawlog"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(all.as_array().unwrap().len(), 3);
    // Newest first.
    assert_eq!(all[0]["raw"], Value::String("0d0a".to_string()));

    let filtered: Value = reqwest::get(app.url("/_rawlog?port=5051&limit=1"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entries = filtered.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["port"], Value::from(5051));
    assert_eq!(entries[0]["raw"], Value::String("0d0a".to_string()));
}

#[tokio::test]
async fn devices_reports_liveness_snapshot() {
    let app = spawn_admin().await;
    app.liveness.touch("867000000000001", Utc::now());
    app.liveness
        .touch("osmand-abc", Utc::now() - TimeDelta::minutes(10));

    let devices: Value = reqwest::get(app.url("/_devices"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entries = devices.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    // Sorted by device id.
    assert_eq!(entries[0]["device_id"], Value::String("867000000000001".to_string()));
    assert_eq!(entries[0]["status"], Value::String("online".to_string()));
    assert_eq!(entries[1]["device_id"], Value::String("osmand-abc".to_string()));
    assert_eq!(entries[1]["status"], Value::String("offline".to_string()));
}

#[tokio::test]
async fn metrics_endpoint_renders() {
    let app = spawn_admin().await;
    let response = reqwest::get(app.url("/metrics")).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
}
