//! Connection Registry
//!
//! Deduplicating table of live connections keyed by (device, channel).
//! Every mutation goes through the map's per-shard entry lock, so two
//! discovery ticks racing on one key can never both insert.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::connection::device::{
    ConnectionContext, ConnectionTable, DeviceConnection, StopReason,
};
use crate::connection::scheduler::Scheduler;
use crate::connection::target::ConnectionKey;
use crate::directory::adapter::ConnectionTarget;

pub struct ConnectionRegistry {
    table: Arc<ConnectionTable>,
    ctx: Arc<ConnectionContext>,
}

impl ConnectionRegistry {
    pub fn new(ctx: ConnectionContext) -> Self {
        Self {
            table: Arc::new(DashMap::new()),
            ctx: Arc::new(ctx),
        }
    }

    /// Return the connection for `key`, creating it if absent.
    ///
    /// An existing connection is reused while its URL is unchanged and it has
    /// not stopped. Otherwise a fresh one takes the slot and the previous one
    /// is torn down. The returned connection is not started.
    pub fn ensure(
        &self,
        key: ConnectionKey,
        url: String,
        target: &ConnectionTarget,
    ) -> Arc<DeviceConnection> {
        let (connection, replaced) = match self.table.entry(key.clone()) {
            Entry::Occupied(mut e) => {
                let current = e.get();
                if current.url() == url && !current.state().is_terminal() {
                    return current.clone();
                }
                // The old connection is fully stopped before the new one
                // becomes visible to other callers
                let previous = current.clone();
                previous.stop_with(StopReason::Replaced);
                let fresh = self.create(key.clone(), url, target);
                e.insert(fresh.clone());
                (fresh, Some(previous))
            }
            Entry::Vacant(e) => {
                let fresh = self.create(key.clone(), url, target);
                e.insert(fresh.clone());
                (fresh, None)
            }
        };

        match replaced {
            Some(previous) => info!(
                key = %key,
                old_url = %previous.url(),
                new_url = %connection.url(),
                "Replaced connection"
            ),
            None => debug!(key = %key, url = %connection.url(), "Registered connection"),
        }

        connection
    }

    fn create(
        &self,
        key: ConnectionKey,
        url: String,
        target: &ConnectionTarget,
    ) -> Arc<DeviceConnection> {
        DeviceConnection::new(
            key,
            url,
            target.clone(),
            self.ctx.clone(),
            Arc::downgrade(&self.table),
        )
    }

    /// Remove and stop the connection for `key`. Removing an absent key is a no-op.
    pub fn remove(&self, key: &ConnectionKey) -> Option<Arc<DeviceConnection>> {
        let (_, connection) = self.table.remove(key)?;
        connection.stop();
        debug!(key = %key, "Removed connection");
        Some(connection)
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<Arc<DeviceConnection>> {
        self.table.get(key).map(|e| e.value().clone())
    }

    pub fn contains(&self, key: &ConnectionKey) -> bool {
        self.table.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn keys(&self) -> Vec<ConnectionKey> {
        self.table.iter().map(|e| e.key().clone()).collect()
    }

    pub fn connections(&self) -> Vec<Arc<DeviceConnection>> {
        self.table.iter().map(|e| e.value().clone()).collect()
    }

    /// Stop and drop every connection
    pub fn stop_all(&self) {
        let keys = self.keys();
        let count = keys.len();
        for key in keys {
            self.remove(&key);
        }
        info!(count, "Stopped all connections");
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.ctx.scheduler
    }
}
