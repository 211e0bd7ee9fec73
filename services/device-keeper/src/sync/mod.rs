//! Downstream sync module
//!
//! Best-effort reporting of device reachability to an external device
//! pool. Nothing here ever feeds back into connection state.

pub mod pool;

use async_trait::async_trait;
use thiserror::Error;

use crate::directory::adapter::{ConnectionTarget, DeviceAddress};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("device pool base URL is not configured")]
    NotConfigured,

    #[error("device pool token is not a valid header value")]
    InvalidToken(#[source] reqwest::header::InvalidHeaderValue),

    #[error("device pool request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("device pool answered {status}: {body}")]
    Status { status: u16, body: String },
}

/// Result of a reachability report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Written,
    /// Same address as the last successful write; nothing was sent
    Unchanged,
}

/// Device pool reporting interface
#[async_trait]
pub trait DeviceSync: Send + Sync {
    /// Register or refresh a device that became reachable at `address`
    async fn device_ready(
        &self,
        target: &ConnectionTarget,
        address: &DeviceAddress,
    ) -> Result<SyncOutcome, SyncError>;

    /// Heartbeat for devices hosted on the agent at `agent_host`
    async fn heartbeat(&self, agent_host: &str, device_ids: &[String]) -> Result<(), SyncError>;

    /// Drop the last known address so the next report is written again
    fn forget(&self, device_id: &str);
}

/// Sync used when no device pool is configured; reports nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledSync;

#[async_trait]
impl DeviceSync for DisabledSync {
    async fn device_ready(
        &self,
        _target: &ConnectionTarget,
        _address: &DeviceAddress,
    ) -> Result<SyncOutcome, SyncError> {
        Ok(SyncOutcome::Unchanged)
    }

    async fn heartbeat(&self, _agent_host: &str, _device_ids: &[String]) -> Result<(), SyncError> {
        Ok(())
    }

    fn forget(&self, _device_id: &str) {}
}
