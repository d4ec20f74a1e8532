//! Device registry
//!
//! Maps the device server's ephemeral node ids (handles) to stable topic
//! identifiers and tracks availability. The registry is the only owner of
//! device records; readers get copies.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// One known device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub handle: u64,
    /// Assigned at first registration and never changed afterwards
    pub stable_id: String,
    pub available: bool,
    pub last_seen: DateTime<Utc>,
    #[serde(skip)]
    pub info: Value,
}

/// Thread-safe registry of devices keyed by handle
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<BTreeMap<u64, Device>>>,
    /// Configured stable identifiers by handle
    overrides: Arc<HashMap<u64, String>>,
}

impl DeviceRegistry {
    pub fn new(overrides: HashMap<u64, String>) -> Self {
        Self {
            devices: Arc::new(RwLock::new(BTreeMap::new())),
            overrides: Arc::new(overrides),
        }
    }

    /// Insert or refresh a device; returns `true` when the handle was unseen
    ///
    /// A known device keeps its original stable identifier; only its info and
    /// last-seen time change.
    pub fn register(&self, handle: u64, info: Value) -> bool {
        let now = Utc::now();
        let mut devices = self.write();

        if let Some(device) = devices.get_mut(&handle) {
            device.info = info;
            device.last_seen = now;
            debug!(node_id = handle, stable_id = %device.stable_id, "Refreshed device");
            return false;
        }

        let stable_id = self.configured_id(handle);
        info!(node_id = handle, stable_id = %stable_id, "Registered device");
        devices.insert(
            handle,
            Device {
                handle,
                stable_id,
                available: true,
                last_seen: now,
                info,
            },
        );
        true
    }

    /// Find the handle for a command identifier
    ///
    /// A numeric identifier naming a known handle wins. Otherwise the first
    /// device whose stable identifier matches exactly, scanning handles in
    /// ascending order. Colliding stable identifiers are not disambiguated.
    pub fn resolve(&self, identifier: &str) -> Option<u64> {
        let devices = self.read();

        if let Ok(handle) = identifier.parse::<u64>() {
            if devices.contains_key(&handle) {
                return Some(handle);
            }
        }

        devices
            .values()
            .find(|device| device.stable_id == identifier)
            .map(|device| device.handle)
    }

    /// Update availability and last-seen, returning the previous availability
    ///
    /// `None` for unknown handles. Unavailable devices stay registered and
    /// resolvable.
    pub fn set_availability(&self, handle: u64, available: bool) -> Option<bool> {
        let mut devices = self.write();
        let device = devices.get_mut(&handle)?;
        let previous = device.available;
        device.available = available;
        device.last_seen = Utc::now();
        Some(previous)
    }

    pub fn get(&self, handle: u64) -> Option<Device> {
        self.read().get(&handle).cloned()
    }

    /// Topic identifier for a handle, registered or not
    pub fn topic_identifier(&self, handle: u64) -> String {
        self.read()
            .get(&handle)
            .map(|device| device.stable_id.clone())
            .unwrap_or_else(|| self.configured_id(handle))
    }

    /// Copy of every device, ordered by handle
    pub fn snapshot(&self) -> Vec<Device> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn configured_id(&self, handle: u64) -> String {
        self.overrides
            .get(&handle)
            .cloned()
            .unwrap_or_else(|| format!("node_{handle}"))
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<u64, Device>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<u64, Device>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }
}
