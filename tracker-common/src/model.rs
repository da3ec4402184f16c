use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

/// A single GPS fix recorded for a device.
///
/// `timestamp` is the moment the device reports having taken the fix, while
/// `created_at` is when this process persisted it. The two can differ by
/// minutes for trackers that buffer while out of coverage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub id: Uuid,
    pub device_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// Speed over ground, in the unit the device reports (km/h for GT06).
    pub speed: Option<f64>,
    /// Extra telemetry reported alongside the fix (battery, altitude, ...).
    pub attributes: Option<Map<String, Value>>,
    pub created_at: DateTime<Utc>,
}

/// A tracked device, created on first contact.
///
/// `external_id` is the identity the device presents on the wire: the IMEI
/// for GT06 trackers, or the client-chosen identifier for OsmAnd clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub id: Uuid,
    pub external_id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Device {
    pub fn new(external_id: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            external_id: external_id.to_owned(),
            name: None,
            created_at: Utc::now(),
        }
    }
}
