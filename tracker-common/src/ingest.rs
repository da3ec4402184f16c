use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::events::{Event, EventBus, EventKind};
use crate::liveness::DeviceLiveness;
use crate::model::{Device, Position};
use crate::store::{DeviceStore, PositionStore, StoreError};

/// Two fixes closer than this on both axes are coordinate-identical.
/// 1e-5 degrees is roughly one meter at the equator.
pub const DUPLICATE_COORD_EPSILON: f64 = 1e-5;
/// Coordinate-identical fixes within this window are dropped as duplicates.
pub const DUPLICATE_WINDOW_MS: i64 = 5_000;

/// A decoded fix as handed over by a protocol server, before any device
/// resolution has happened. `device_id` is the wire identity.
#[derive(Debug, Clone)]
pub struct IncomingPosition {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: Option<f64>,
    pub attributes: Option<Map<String, Value>>,
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("device id is required")]
    MissingDeviceId,
    #[error("latitude must be between -90 and 90, got {0}")]
    InvalidLatitude(f64),
    #[error("longitude must be between -180 and 180, got {0}")]
    InvalidLongitude(f64),
    #[error("speed must be >= 0, got {0}")]
    InvalidSpeed(f64),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    pub fn is_validation(&self) -> bool {
        !matches!(self, IngestError::Store(_))
    }
}

/// The single write path shared by all protocol servers.
///
/// Ordering matters here: liveness and the `position.received` event reflect
/// every valid report, including ones later dropped as duplicates or lost to
/// a storage failure. Only persisted fixes get a `position.recorded` event.
pub struct PositionIngestor {
    devices: Arc<dyn DeviceStore + Send + Sync>,
    positions: Arc<dyn PositionStore + Send + Sync>,
    liveness: Arc<DeviceLiveness>,
    bus: Arc<EventBus>,
}

impl PositionIngestor {
    pub fn new(
        devices: Arc<dyn DeviceStore + Send + Sync>,
        positions: Arc<dyn PositionStore + Send + Sync>,
        liveness: Arc<DeviceLiveness>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            devices,
            positions,
            liveness,
            bus,
        }
    }

    #[instrument(skip_all, fields(device_id = %incoming.device_id))]
    pub async fn record(&self, incoming: IncomingPosition) -> Result<Position, IngestError> {
        validate(&incoming)?;
        metrics::counter!("positions_received_total").increment(1);

        self.liveness.touch(&incoming.device_id, incoming.timestamp);
        self.bus
            .publish(Event::new(
                EventKind::PositionReceived,
                &incoming.device_id,
                json!({
                    "device_id": incoming.device_id,
                    "latitude": incoming.latitude,
                    "longitude": incoming.longitude,
                    "timestamp": incoming.timestamp,
                }),
            ))
            .await;

        let device = match self.devices.find_by_external_id(&incoming.device_id).await? {
            Some(device) => device,
            None => self.devices.create(Device::new(&incoming.device_id)).await?,
        };

        if let Some(prior) = self
            .positions
            .find_latest(device.id, 1)
            .await?
            .into_iter()
            .next()
        {
            if is_duplicate(&prior, &incoming) {
                metrics::counter!("positions_deduplicated_total").increment(1);
                debug!(prior = %prior.id, "dropping duplicate fix");
                return Ok(prior);
            }
        }

        let position = self
            .positions
            .save(Position {
                id: Uuid::now_v7(),
                device_id: device.id,
                timestamp: incoming.timestamp,
                latitude: incoming.latitude,
                longitude: incoming.longitude,
                speed: incoming.speed,
                attributes: incoming.attributes,
                created_at: Utc::now(),
            })
            .await?;
        metrics::counter!("positions_recorded_total").increment(1);

        self.bus
            .publish(Event::new(
                EventKind::PositionRecorded,
                position.id.to_string(),
                json!({
                    "position_id": position.id,
                    "device_id": device.id,
                    "external_id": device.external_id,
                    "latitude": position.latitude,
                    "longitude": position.longitude,
                    "speed": position.speed,
                    "timestamp": position.timestamp,
                }),
            ))
            .await;

        Ok(position)
    }
}

fn validate(incoming: &IncomingPosition) -> Result<(), IngestError> {
    if incoming.device_id.is_empty() {
        reject("missing_device_id");
        return Err(IngestError::MissingDeviceId);
    }
    if !(-90.0..=90.0).contains(&incoming.latitude) {
        reject("latitude");
        return Err(IngestError::InvalidLatitude(incoming.latitude));
    }
    if !(-180.0..=180.0).contains(&incoming.longitude) {
        reject("longitude");
        return Err(IngestError::InvalidLongitude(incoming.longitude));
    }
    if let Some(speed) = incoming.speed {
        // Also rejects NaN.
        if !(speed >= 0.0) {
            reject("speed");
            return Err(IngestError::InvalidSpeed(speed));
        }
    }
    Ok(())
}

fn reject(reason: &'static str) {
    metrics::counter!("positions_rejected_total", &[("reason", reason)]).increment(1);
}

fn is_duplicate(prior: &Position, incoming: &IncomingPosition) -> bool {
    (prior.latitude - incoming.latitude).abs() <= DUPLICATE_COORD_EPSILON
        && (prior.longitude - incoming.longitude).abs() <= DUPLICATE_COORD_EPSILON
        && (prior.timestamp - incoming.timestamp)
            .num_milliseconds()
            .abs()
            <= DUPLICATE_WINDOW_MS
}
