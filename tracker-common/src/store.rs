use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{Device, Position};

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence for recorded positions.
#[async_trait]
pub trait PositionStore {
    async fn save(&self, position: Position) -> Result<Position, StoreError>;

    /// The most recent positions for a device, newest first.
    async fn find_latest(&self, device_id: Uuid, limit: usize)
        -> Result<Vec<Position>, StoreError>;
}

/// Persistence for devices, keyed by the identity they present on the wire.
#[async_trait]
pub trait DeviceStore {
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<Device>, StoreError>;

    /// Create the device, or return the existing one if two ingests race on
    /// the same external id.
    async fn create(&self, device: Device) -> Result<Device, StoreError>;
}

#[derive(Default)]
pub struct MemoryPositionStore {
    by_device: Mutex<HashMap<Uuid, Vec<Position>>>,
}

impl MemoryPositionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.by_device.lock().unwrap().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn save(&self, position: Position) -> Result<Position, StoreError> {
        let mut by_device = self.by_device.lock().unwrap();
        by_device
            .entry(position.device_id)
            .or_default()
            .push(position.clone());
        Ok(position)
    }

    async fn find_latest(
        &self,
        device_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Position>, StoreError> {
        let by_device = self.by_device.lock().unwrap();
        let positions = match by_device.get(&device_id) {
            Some(positions) => positions.iter().rev().take(limit).cloned().collect(),
            None => Vec::new(),
        };
        Ok(positions)
    }
}

#[derive(Default)]
pub struct MemoryDeviceStore {
    by_external_id: Mutex<HashMap<String, Device>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.by_external_id.lock().unwrap().len()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<Device>, StoreError> {
        let by_external_id = self.by_external_id.lock().unwrap();
        Ok(by_external_id.get(external_id).cloned())
    }

    async fn create(&self, device: Device) -> Result<Device, StoreError> {
        let mut by_external_id = self.by_external_id.lock().unwrap();
        let device = by_external_id
            .entry(device.external_id.clone())
            .or_insert(device);
        Ok(device.clone())
    }
}
