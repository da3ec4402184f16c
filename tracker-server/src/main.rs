//! Tracker ingestion process: GT06 TCP listener, OsmAnd HTTP listener and the
//! admin surface, wired to one shared ingestion pipeline.
use std::net::SocketAddr;
use std::sync::Arc;

use envconfig::Envconfig;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use gt06::server::Gt06Server;
use gt06::session::Gt06Handler;
use health::HealthRegistry;
use hook_dispatcher::dispatcher::WebhookDispatcher;
use hook_dispatcher::retry::RetryPolicy;
use tracker_common::events::{EventBus, EventKind};
use tracker_common::ingest::PositionIngestor;
use tracker_common::liveness::DeviceLiveness;
use tracker_common::metrics::setup_metrics_recorder;
use tracker_common::rawlog::RawLog;
use tracker_common::store::{MemoryDeviceStore, MemoryPositionStore};
use tracker_common::webhook::{MemoryWebhookStore, Webhook, WebhookStore};

use tracker_server::admin::{self, AdminState};
use tracker_server::config::Config;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
}

/// Resolves once the shutdown sender is dropped.
async fn wait_for(mut trigger: watch::Receiver<()>) {
    _ = trigger.changed().await;
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");
    let recorder_handle = setup_metrics_recorder();

    let devices = MemoryDeviceStore::new();
    let positions = MemoryPositionStore::new();
    let webhooks = MemoryWebhookStore::new();
    let device_liveness = Arc::new(DeviceLiveness::new());
    let bus = Arc::new(EventBus::new());
    let rawlog = Arc::new(RawLog::new());
    let ingestor = Arc::new(PositionIngestor::new(
        devices,
        positions,
        device_liveness.clone(),
        bus.clone(),
    ));

    let dispatcher = Arc::new(WebhookDispatcher::new(
        webhooks.clone(),
        RetryPolicy::default(),
        config.webhook_timeout.0,
    ));
    dispatcher.attach(&bus).await;

    if let Some(url) = &config.webhook_url {
        let events = config
            .webhook_events
            .clone()
            .map(|list| list.0)
            .unwrap_or_else(|| EventKind::ALL.to_vec());
        webhooks
            .register(Webhook::new(url.clone(), events))
            .await
            .expect("failed to register startup webhook");
        info!("registered startup webhook for {}", url);
    }

    let liveness = HealthRegistry::new("liveness");

    let gt06_handler = Arc::new(Gt06Handler::new(
        ingestor.clone(),
        device_liveness.clone(),
        bus.clone(),
    ));
    let gt06_server = Gt06Server::new(gt06_handler, bus.clone(), rawlog.clone());
    let gt06_listener = TcpListener::bind(config.gt06_bind())
        .await
        .expect("failed to bind gt06 listener");
    let gt06_health = liveness
        .register("gt06".to_string(), time::Duration::seconds(30))
        .await;
    info!("gt06 listening on {}", config.gt06_bind());

    let osmand_app = osmand::router::router(ingestor, rawlog.clone(), config.osmand_port);
    let osmand_listener = TcpListener::bind(config.osmand_bind())
        .await
        .expect("failed to bind osmand listener");
    info!("osmand listening on {}", config.osmand_bind());

    let admin_state = AdminState {
        liveness: device_liveness,
        rawlog,
        online_threshold: config.online_threshold.0,
    };
    let admin_app = admin::router(admin_state, liveness.clone(), recorder_handle);
    let admin_listener = TcpListener::bind(config.admin_bind())
        .await
        .expect("failed to bind admin listener");
    info!("admin listening on {}", config.admin_bind());

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(async move {
        shutdown().await;
        drop(shutdown_tx);
    });

    let gt06_task = {
        let trigger = wait_for(shutdown_rx.clone());
        tokio::spawn(async move {
            gt06_server.serve(gt06_listener, gt06_health, trigger).await;
        })
    };
    let osmand_task = {
        let trigger = wait_for(shutdown_rx.clone());
        tokio::spawn(async move {
            axum::serve(
                osmand_listener,
                osmand_app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(trigger)
            .await
            .expect("osmand server failed");
        })
    };
    let admin_task = {
        let trigger = wait_for(shutdown_rx);
        tokio::spawn(async move {
            axum::serve(admin_listener, admin_app)
                .with_graceful_shutdown(trigger)
                .await
                .expect("admin server failed");
        })
    };

    let _unused = tokio::join!(gt06_task, osmand_task, admin_task);
    info!("tracker stopped");
}
