use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use health::HealthHandle;
use tracker_common::events::{Event, EventBus, EventKind};
use tracker_common::rawlog::{hex_string, RawLog};

use crate::session::{Gt06Handler, Session};

const LIVENESS_INTERVAL: Duration = Duration::from_secs(10);

/// TCP front for GT06 trackers. Owns the listener and the socket lifecycle,
/// protocol work is delegated to [`Gt06Handler`].
#[derive(Clone)]
pub struct Gt06Server {
    handler: Arc<Gt06Handler>,
    bus: Arc<EventBus>,
    rawlog: Arc<RawLog>,
}

impl Gt06Server {
    pub fn new(handler: Arc<Gt06Handler>, bus: Arc<EventBus>, rawlog: Arc<RawLog>) -> Self {
        Self {
            handler,
            bus,
            rawlog,
        }
    }

    /// Accept connections until `shutdown` resolves. Shutdown closes the open
    /// sockets and waits for their tasks before releasing the listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
        liveness: HealthHandle,
        shutdown: impl Future<Output = ()>,
    ) {
        let port = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or_default();
        // Connection tasks stop when the sender side is dropped.
        let (close_tx, close_rx) = watch::channel(());
        let mut connections = JoinSet::new();
        let mut next_connection_id: u64 = 0;
        let mut report = tokio::time::interval(LIVENESS_INTERVAL);
        tokio::pin!(shutdown);

        info!(port, "GT06 server listening");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = report.tick() => liveness.report_healthy().await,
                Some(_) = connections.join_next(), if !connections.is_empty() => {},
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        next_connection_id += 1;
                        connections.spawn(run_connection(
                            self.clone(),
                            stream,
                            remote_addr,
                            next_connection_id,
                            port,
                            close_rx.clone(),
                        ));
                    }
                    Err(err) => warn!("failed to accept connection: {}", err),
                },
            }
        }

        // Sockets first, listener second.
        drop(close_tx);
        while connections.join_next().await.is_some() {}
        info!(port, "GT06 server stopped");
    }
}

async fn run_connection(
    server: Gt06Server,
    mut stream: TcpStream,
    remote_addr: SocketAddr,
    connection_id: u64,
    port: u16,
    mut close: watch::Receiver<()>,
) {
    info!(connection_id, %remote_addr, "tracker connected");
    metrics::gauge!("gt06_open_connections").increment(1.0);
    server
        .bus
        .publish(Event::new(
            EventKind::DeviceOnline,
            remote_addr.to_string(),
            json!({"source": "gt06", "connection_id": connection_id}),
        ))
        .await;

    let mut session = Session::new(connection_id, remote_addr);
    let mut buffer = [0u8; 1024];
    loop {
        tokio::select! {
            _ = close.changed() => break,
            read = stream.read(&mut buffer) => match read {
                Ok(0) => {
                    debug!(connection_id, "connection closed by peer");
                    break;
                }
                Ok(n) => {
                    let chunk = &buffer[..n];
                    let raw = hex_string(chunk);
                    debug!(connection_id, bytes = n, raw, "chunk received");
                    server.rawlog.push(port, Some(remote_addr.to_string()), raw);

                    if let Some(ack) = server.handler.handle_packet(&mut session, chunk).await {
                        if let Err(err) = stream.write_all(&ack).await {
                            warn!(connection_id, "failed to write ack: {}", err);
                            break;
                        }
                    }
                }
                Err(err) => {
                    warn!(connection_id, "socket error: {}", err);
                    break;
                }
            },
        }
    }

    metrics::gauge!("gt06_open_connections").decrement(1.0);
    server
        .bus
        .publish(Event::new(
            EventKind::DeviceOffline,
            remote_addr.to_string(),
            json!({"source": "gt06", "connection_id": connection_id}),
        ))
        .await;
    info!(connection_id, %remote_addr, "tracker disconnected");
}
