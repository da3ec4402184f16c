use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

/// A device is reported online if it was heard from within this window.
pub const DEFAULT_ONLINE_THRESHOLD: Duration = Duration::from_millis(120_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize)]
pub struct LivenessEntry {
    pub device_id: String,
    pub last_seen: DateTime<Utc>,
    pub status: DeviceStatus,
}

/// Last-seen bookkeeping for devices, keyed by their raw external identity.
///
/// Writes are last-write-wins on purpose: positions can arrive out of order
/// (buffered GT06 uploads, HTTP retries) and this map tracks the most recent
/// contact, not the most recent fix. Devices never heard from are offline.
#[derive(Default)]
pub struct DeviceLiveness {
    last_seen: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl DeviceLiveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record contact with a device. Overwrites unconditionally, even when
    /// `at` is older than the stored timestamp.
    pub fn touch(&self, device_id: &str, at: DateTime<Utc>) {
        let mut last_seen = self.last_seen.write().expect("poisoned DeviceLiveness lock");
        last_seen.insert(device_id.to_owned(), at);
    }

    pub fn last_seen(&self, device_id: &str) -> Option<DateTime<Utc>> {
        let last_seen = self.last_seen.read().expect("poisoned DeviceLiveness lock");
        last_seen.get(device_id).copied()
    }

    pub fn status(&self, device_id: &str, threshold: Duration) -> DeviceStatus {
        let Some(last_seen) = self.last_seen(device_id) else {
            return DeviceStatus::Offline;
        };
        let threshold = TimeDelta::from_std(threshold).unwrap_or(TimeDelta::MAX);
        if Utc::now().signed_duration_since(last_seen) <= threshold {
            DeviceStatus::Online
        } else {
            DeviceStatus::Offline
        }
    }

    /// Every known device with its last-seen time, for the admin surface.
    pub fn snapshot(&self, threshold: Duration) -> Vec<LivenessEntry> {
        let last_seen = self.last_seen.read().expect("poisoned DeviceLiveness lock");
        let mut entries: Vec<LivenessEntry> = last_seen
            .iter()
            .map(|(device_id, at)| LivenessEntry {
                device_id: device_id.clone(),
                last_seen: *at,
                status: DeviceStatus::Offline,
            })
            .collect();
        drop(last_seen);
        for entry in &mut entries {
            entry.status = self.status(&entry.device_id, threshold);
        }
        entries.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        entries
    }
}
