use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Unique identifier for devices (OLTs)
pub type DeviceId = Uuid;

/// Lightweight device handle exposed by the external inventory
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DeviceRef {
    pub id: DeviceId,
    pub name: String,
    pub enabled: bool,
}

/// Read-only view of the device inventory.
///
/// The inventory itself (addresses, credentials, brands) lives outside this
/// crate; the coordinator only ever needs the set of enabled devices.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn get_enabled_devices(&self) -> Vec<DeviceRef>;
}

/// In-memory registry backed by a fixed device list
pub struct StaticDeviceRegistry {
    devices: tokio::sync::RwLock<HashMap<DeviceId, DeviceRef>>,
}

impl StaticDeviceRegistry {
    pub fn new(devices: Vec<DeviceRef>) -> Self {
        let map = devices.into_iter().map(|d| (d.id, d)).collect();
        Self {
            devices: tokio::sync::RwLock::new(map),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub async fn add_device(&self, device: DeviceRef) {
        self.devices.write().await.insert(device.id, device);
    }

    pub async fn set_enabled(&self, device_id: DeviceId, enabled: bool) {
        if let Some(device) = self.devices.write().await.get_mut(&device_id) {
            device.enabled = enabled;
        }
    }
}

#[async_trait]
impl DeviceRegistry for StaticDeviceRegistry {
    async fn get_enabled_devices(&self) -> Vec<DeviceRef> {
        self.devices
            .read()
            .await
            .values()
            .filter(|d| d.enabled)
            .cloned()
            .collect()
    }
}

/// Logical position of a subscriber record on the device
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct PonLocation {
    pub slot: u32,
    pub port: u32,
    pub unit: u32,
}

/// Translates device-native record indexes to logical slot/port/unit
/// positions and back.
///
/// The translation formulas are brand-specific and maintained elsewhere;
/// the coordination core treats them as an opaque pure function.
pub trait IndexResolver: Send + Sync {
    fn resolve(&self, raw_index: u64) -> PonLocation;
    fn raw_index(&self, location: PonLocation) -> u64;
}

/// Resolver for devices that pack slot/port/unit linearly.
pub struct LinearIndexResolver {
    pub ports_per_slot: u32,
    pub units_per_port: u32,
}

impl Default for LinearIndexResolver {
    fn default() -> Self {
        Self {
            ports_per_slot: 16,
            units_per_port: 128,
        }
    }
}

impl IndexResolver for LinearIndexResolver {
    fn resolve(&self, raw_index: u64) -> PonLocation {
        let per_slot = (self.ports_per_slot * self.units_per_port) as u64;
        let per_port = self.units_per_port as u64;
        PonLocation {
            slot: (raw_index / per_slot) as u32,
            port: ((raw_index % per_slot) / per_port) as u32,
            unit: (raw_index % per_port) as u32,
        }
    }

    fn raw_index(&self, location: PonLocation) -> u64 {
        let per_slot = (self.ports_per_slot * self.units_per_port) as u64;
        let per_port = self.units_per_port as u64;
        location.slot as u64 * per_slot + location.port as u64 * per_port + location.unit as u64
    }
}

/// Shared resolver handle used by the worker-side task handlers
pub type SharedIndexResolver = Arc<dyn IndexResolver>;
