use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, instrument, warn};

use tracker_common::events::{Event, EventBus, EventKind};
use tracker_common::ingest::{IncomingPosition, PositionIngestor};
use tracker_common::liveness::DeviceLiveness;

use crate::codec::{self, Gt06Packet, PacketKind};

/// Per-connection state. The only thing carried across packets is the
/// identity announced at login, so later location frames without an embedded
/// IMEI can still be attributed.
#[derive(Debug)]
pub struct Session {
    pub connection_id: u64,
    pub remote_addr: SocketAddr,
    pub device_id: Option<String>,
}

impl Session {
    pub fn new(connection_id: u64, remote_addr: SocketAddr) -> Self {
        Self {
            connection_id,
            remote_addr,
            device_id: None,
        }
    }
}

/// Message-type dispatch for decoded frames. Owns no sockets: the server
/// hands over each inbound chunk and writes back whatever ack we return.
pub struct Gt06Handler {
    ingestor: Arc<PositionIngestor>,
    liveness: Arc<DeviceLiveness>,
    bus: Arc<EventBus>,
}

impl Gt06Handler {
    pub fn new(
        ingestor: Arc<PositionIngestor>,
        liveness: Arc<DeviceLiveness>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            ingestor,
            liveness,
            bus,
        }
    }

    #[instrument(skip_all, fields(connection_id = session.connection_id))]
    pub async fn handle_packet(&self, session: &mut Session, buffer: &[u8]) -> Option<Vec<u8>> {
        let packet = codec::decode(buffer);

        if let Some(error) = &packet.error {
            metrics::counter!("gt06_packets_invalid_total", &[("reason", error.label())])
                .increment(1);
            warn!(kind = packet.kind.as_str(), "invalid packet: {}", error);
            return None;
        }
        metrics::counter!("gt06_packets_total", &[("type", packet.kind.as_str())]).increment(1);

        match packet.kind {
            PacketKind::Login => self.handle_login(session, &packet).await,
            PacketKind::Heartbeat => self.handle_heartbeat(session, &packet).await,
            PacketKind::Gps => self.handle_gps(session, &packet).await,
            PacketKind::Unknown => {
                warn!(
                    message_type = format!("{:#04x}", packet.message_type),
                    "unrecognized message type"
                );
                None
            }
        }
    }

    async fn handle_login(&self, session: &mut Session, packet: &Gt06Packet) -> Option<Vec<u8>> {
        match packet.data.as_ref().and_then(|data| data.imei.clone()) {
            Some(imei) => {
                debug!(imei, "device logged in");
                self.mark_online(session, &imei).await;
                session.device_id = Some(imei);
            }
            None => warn!("login packet without a decodable IMEI"),
        }
        Some(codec::build_ack(packet.message_type, &[]))
    }

    async fn handle_heartbeat(
        &self,
        session: &mut Session,
        packet: &Gt06Packet,
    ) -> Option<Vec<u8>> {
        // Some devices repeat their IMEI in heartbeats, most leave it out.
        let identity = packet
            .data
            .as_ref()
            .and_then(|data| data.imei.clone())
            .or_else(|| session.device_id.clone());
        if let Some(imei) = identity {
            self.mark_online(session, &imei).await;
            session.device_id = Some(imei);
        }
        Some(codec::build_ack(packet.message_type, &[]))
    }

    async fn handle_gps(&self, session: &mut Session, packet: &Gt06Packet) -> Option<Vec<u8>> {
        let Some(data) = packet.data.as_ref() else {
            return None;
        };

        let Some(device_id) = data.imei.clone().or_else(|| session.device_id.clone()) else {
            warn!("location frame from a connection that never logged in");
            return None;
        };

        if let (Some(latitude), Some(longitude), Some(timestamp)) =
            (data.latitude, data.longitude, data.timestamp)
        {
            let incoming = IncomingPosition {
                device_id: device_id.clone(),
                timestamp,
                latitude,
                longitude,
                speed: data.speed,
                attributes: None,
            };
            // Transport never sees ingestion failures, the device would only
            // disconnect and retry.
            if let Err(err) = self.ingestor.record(incoming).await {
                warn!(device_id, "failed to ingest location frame: {}", err);
            }
        } else {
            debug!(device_id, "location frame without a usable fix");
        }

        let last_seen = data.timestamp.unwrap_or_else(Utc::now);
        self.liveness.touch(&device_id, last_seen);
        self.bus
            .publish(Event::new(
                EventKind::DeviceOnline,
                &device_id,
                json!({"source": "gt06", "connection_id": session.connection_id}),
            ))
            .await;

        // Location reports are not acknowledged.
        None
    }

    async fn mark_online(&self, session: &Session, imei: &str) {
        self.liveness.touch(imei, Utc::now());
        self.bus
            .publish(Event::new(
                EventKind::DeviceOnline,
                imei,
                json!({"source": "gt06", "connection_id": session.connection_id}),
            ))
            .await;
    }
}
