use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_json_diff::assert_json_include;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use serde_json::{json, Value};

use hook_dispatcher::dispatcher::WebhookDispatcher;
use hook_dispatcher::retry::RetryPolicy;
use tracker_common::events::{Event, EventBus, EventKind};
use tracker_common::webhook::{MemoryWebhookStore, Webhook, WebhookStore};

struct Endpoint {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<String>>>,
}

impl Endpoint {
    fn url(&self) -> String {
        format!("http://{}/hook", self.addr)
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Serves `/hook`, counting every request and answering `status` after
/// `delay`.
async fn spawn_endpoint(status: StatusCode, delay: Duration) -> Endpoint {
    let hits = Arc::new(AtomicUsize::new(0));
    let bodies = Arc::new(Mutex::new(Vec::new()));
    let handler_hits = hits.clone();
    let handler_bodies = bodies.clone();

    let app = Router::new().route(
        "/hook",
        post(move |body: String| {
            let hits = handler_hits.clone();
            let bodies = handler_bodies.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                bodies.lock().unwrap().push(body);
                tokio::time::sleep(delay).await;
                status
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().expect("failed to read local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("endpoint quit");
    });

    Endpoint { addr, hits, bodies }
}

fn fast_dispatcher(store: Arc<MemoryWebhookStore>) -> Arc<WebhookDispatcher> {
    Arc::new(WebhookDispatcher::new(
        store,
        RetryPolicy::new(2, 2, Duration::from_millis(10)),
        Duration::from_secs(3),
    ))
}

async fn assert_or_retry<F>(check: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(check());
}

#[tokio::test]
async fn server_errors_are_retried_until_attempts_run_out() {
    let endpoint = spawn_endpoint(StatusCode::INTERNAL_SERVER_ERROR, Duration::ZERO).await;
    let store = MemoryWebhookStore::new();
    store
        .register(Webhook::new(
            endpoint.url(),
            vec![EventKind::PositionRecorded],
        ))
        .await
        .unwrap();
    let bus = EventBus::new();
    fast_dispatcher(store.clone()).attach(&bus).await;

    bus.publish(Event::new(
        EventKind::PositionRecorded,
        "p1",
        json!({"position_id": "p1"}),
    ))
    .await;

    // One initial attempt plus two retries, then the chain is abandoned.
    assert_or_retry(|| endpoint.hits() == 3).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(endpoint.hits(), 3);

    let webhooks = store.all().await.unwrap();
    assert!(webhooks[0].last_delivered_at.is_none());
}

#[tokio::test]
async fn first_success_stops_the_chain_and_records_delivery() {
    let endpoint = spawn_endpoint(StatusCode::OK, Duration::ZERO).await;
    let store = MemoryWebhookStore::new();
    store
        .register(Webhook::new(
            endpoint.url(),
            vec![EventKind::PositionRecorded],
        ))
        .await
        .unwrap();
    let bus = EventBus::new();
    fast_dispatcher(store.clone()).attach(&bus).await;

    bus.publish(Event::new(
        EventKind::PositionRecorded,
        "p1",
        json!({"position_id": "p1", "latitude": 48.8566}),
    ))
    .await;

    assert_or_retry(|| endpoint.hits() == 1).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if store.all().await.unwrap()[0].last_delivered_at.is_some() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "delivery was never recorded"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(endpoint.hits(), 1);

    let bodies = endpoint.bodies.lock().unwrap();
    let payload: Value = serde_json::from_str(&bodies[0]).unwrap();
    assert_json_include!(
        actual: payload.clone(),
        expected: json!({
            "event": "position.recorded",
            "data": {"position_id": "p1", "latitude": 48.8566},
        })
    );
    assert!(payload.get("timestamp").is_some());
}

#[tokio::test]
async fn any_non_2xx_response_is_retried() {
    let endpoint = spawn_endpoint(StatusCode::NOT_FOUND, Duration::ZERO).await;
    let store = MemoryWebhookStore::new();
    store
        .register(Webhook::new(endpoint.url(), vec![EventKind::DeviceOnline]))
        .await
        .unwrap();
    let bus = EventBus::new();
    fast_dispatcher(store.clone()).attach(&bus).await;

    bus.publish(Event::new(EventKind::DeviceOnline, "dev", Value::Null))
        .await;

    assert_or_retry(|| endpoint.hits() == 3).await;
}

#[tokio::test]
async fn timeouts_are_not_retried() {
    let endpoint = spawn_endpoint(StatusCode::OK, Duration::from_secs(2)).await;
    let store = MemoryWebhookStore::new();
    store
        .register(Webhook::new(endpoint.url(), vec![EventKind::DeviceOnline]))
        .await
        .unwrap();
    let dispatcher = Arc::new(WebhookDispatcher::new(
        store.clone(),
        RetryPolicy::new(2, 2, Duration::from_millis(10)),
        Duration::from_millis(100),
    ));
    let bus = EventBus::new();
    dispatcher.attach(&bus).await;

    bus.publish(Event::new(EventKind::DeviceOnline, "dev", Value::Null))
        .await;

    assert_or_retry(|| endpoint.hits() == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(endpoint.hits(), 1);
}

#[tokio::test]
async fn deliveries_filter_on_subscribed_event_kinds() {
    let online_endpoint = spawn_endpoint(StatusCode::OK, Duration::ZERO).await;
    let recorded_endpoint = spawn_endpoint(StatusCode::OK, Duration::ZERO).await;
    let store = MemoryWebhookStore::new();
    store
        .register(Webhook::new(
            online_endpoint.url(),
            vec![EventKind::DeviceOnline],
        ))
        .await
        .unwrap();
    store
        .register(Webhook::new(
            recorded_endpoint.url(),
            vec![EventKind::PositionRecorded],
        ))
        .await
        .unwrap();
    let bus = EventBus::new();
    fast_dispatcher(store.clone()).attach(&bus).await;

    bus.publish(Event::new(EventKind::PositionRecorded, "p1", Value::Null))
        .await;

    assert_or_retry(|| recorded_endpoint.hits() == 1).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(online_endpoint.hits(), 0);
}

#[tokio::test]
async fn inactive_webhooks_are_skipped() {
    let endpoint = spawn_endpoint(StatusCode::OK, Duration::ZERO).await;
    let store = MemoryWebhookStore::new();
    let mut webhook = Webhook::new(endpoint.url(), vec![EventKind::DeviceOffline]);
    webhook.active = false;
    store.register(webhook).await.unwrap();
    let bus = EventBus::new();
    fast_dispatcher(store.clone()).attach(&bus).await;

    bus.publish(Event::new(EventKind::DeviceOffline, "dev", Value::Null))
        .await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(endpoint.hits(), 0);
}

#[tokio::test]
async fn unparseable_urls_do_not_block_other_deliveries() {
    let endpoint = spawn_endpoint(StatusCode::OK, Duration::ZERO).await;
    let store = MemoryWebhookStore::new();
    store
        .register(Webhook::new(
            "not a url at all",
            vec![EventKind::PositionRecorded],
        ))
        .await
        .unwrap();
    store
        .register(Webhook::new(
            endpoint.url(),
            vec![EventKind::PositionRecorded],
        ))
        .await
        .unwrap();
    let bus = EventBus::new();
    fast_dispatcher(store.clone()).attach(&bus).await;

    bus.publish(Event::new(EventKind::PositionRecorded, "p1", Value::Null))
        .await;

    assert_or_retry(|| endpoint.hits() == 1).await;
}

#[tokio::test]
async fn publisher_is_not_blocked_by_slow_endpoints() {
    let endpoint = spawn_endpoint(StatusCode::OK, Duration::from_secs(1)).await;
    let store = MemoryWebhookStore::new();
    store
        .register(Webhook::new(endpoint.url(), vec![EventKind::DeviceOnline]))
        .await
        .unwrap();
    let bus = EventBus::new();
    fast_dispatcher(store.clone()).attach(&bus).await;

    let started = tokio::time::Instant::now();
    bus.publish(Event::new(EventKind::DeviceOnline, "dev", Value::Null))
        .await;
    assert!(started.elapsed() < Duration::from_millis(300));

    // The detached chain still lands the delivery.
    assert_or_retry(|| endpoint.hits() == 1).await;
}
