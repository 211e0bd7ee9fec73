//! In-memory directory
//!
//! A [`TargetSource`] and [`DeviceAddressSink`] backed by process memory.
//! Used when the keeper is embedded next to an existing registry and in
//! tests.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::directory::adapter::{ConnectionTarget, DeviceAddress, DeviceAddressSink, TargetSource};

/// Recorded sink operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressUpdate {
    Upsert(DeviceAddress),
    Clear(String),
}

#[derive(Default)]
pub struct MemoryDirectory {
    targets: RwLock<Vec<ConnectionTarget>>,
    addresses: DashMap<String, String>,
    history: RwLock<Vec<AddressUpdate>>,
    queries: AtomicUsize,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_targets(targets: Vec<ConnectionTarget>) -> Self {
        let directory = Self::new();
        directory.set_targets(targets);
        directory
    }

    /// Replace the set of online devices returned by the next query
    pub fn set_targets(&self, targets: Vec<ConnectionTarget>) {
        *self.targets.write() = targets;
    }

    /// Stored `host:port` for a device; `None` when never written or cleared
    pub fn address(&self, device_id: &str) -> Option<String> {
        self.addresses
            .get(device_id)
            .map(|v| v.value().clone())
            .filter(|v| !v.is_empty())
    }

    /// Every sink call in arrival order
    pub fn history(&self) -> Vec<AddressUpdate> {
        self.history.read().clone()
    }

    pub fn upserts_for(&self, device_id: &str) -> Vec<DeviceAddress> {
        self.history
            .read()
            .iter()
            .filter_map(|u| match u {
                AddressUpdate::Upsert(a) if a.device_id == device_id => Some(a.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clears_for(&self, device_id: &str) -> usize {
        self.history
            .read()
            .iter()
            .filter(|u| matches!(u, AddressUpdate::Clear(id) if id == device_id))
            .count()
    }

    /// Number of `online_targets` calls served
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TargetSource for MemoryDirectory {
    async fn online_targets(&self) -> Result<Vec<ConnectionTarget>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.targets.read().clone())
    }
}

#[async_trait]
impl DeviceAddressSink for MemoryDirectory {
    async fn upsert(&self, address: &DeviceAddress) -> Result<()> {
        self.addresses
            .insert(address.device_id.clone(), address.endpoint());
        self.history.write().push(AddressUpdate::Upsert(address.clone()));
        Ok(())
    }

    async fn clear(&self, device_id: &str) -> Result<()> {
        self.addresses.insert(device_id.to_string(), String::new());
        self.history
            .write()
            .push(AddressUpdate::Clear(device_id.to_string()));
        Ok(())
    }
}
