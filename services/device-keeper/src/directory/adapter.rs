//! Directory Adapter Traits
//!
//! Defines the narrow interfaces the keeper consumes from the device
//! registry: a source of connection targets and a sink for forwarding
//! addresses.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Device platform as reported by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
}

impl Platform {
    /// Path segment used in agent WebSocket URLs
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptive device data forwarded to the downstream device pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub model: Option<String>,
    pub version: Option<String>,
    pub resolution: Option<String>,
    pub tidevice_socket: Option<String>,
}

/// Everything needed to address one device on its agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTarget {
    /// Agent host
    pub host: String,
    /// Agent port
    pub port: u16,
    pub platform: Platform,
    /// Agent secret key
    pub secret_key: String,
    pub device_id: String,
    /// Per-device auth token
    pub auth_token: String,
    #[serde(default)]
    pub profile: DeviceProfile,
}

/// Forwarding address an agent assigned to a device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub device_id: String,
    pub forward_host: String,
    pub forward_port: u16,
}

impl DeviceAddress {
    pub fn new(device_id: impl Into<String>, forward_host: impl Into<String>, forward_port: u16) -> Self {
        Self {
            device_id: device_id.into(),
            forward_host: forward_host.into(),
            forward_port,
        }
    }

    /// `host:port` form stored in the registry
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.forward_host, self.forward_port)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}:{}", self.device_id, self.forward_host, self.forward_port)
    }
}

/// Source of online devices, polled on every discovery tick
#[async_trait]
pub trait TargetSource: Send + Sync {
    /// Devices currently marked reachable, with their agent coordinates
    async fn online_targets(&self) -> Result<Vec<ConnectionTarget>>;
}

/// Writer of device forwarding addresses
#[async_trait]
pub trait DeviceAddressSink: Send + Sync {
    /// Idempotent upsert of `forward_host:forward_port` for a device
    async fn upsert(&self, address: &DeviceAddress) -> Result<()>;

    /// Clear the stored address of a device
    async fn clear(&self, device_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_deserialization() {
        let json = r#"{
            "host": "10.0.0.5",
            "port": 7777,
            "platform": "ios",
            "secret_key": "secret",
            "device_id": "00008101-000A",
            "auth_token": "tok"
        }"#;

        let target: ConnectionTarget = serde_json::from_str(json).unwrap();
        assert_eq!(target.platform, Platform::Ios);
        assert_eq!(target.port, 7777);
        assert_eq!(target.profile, DeviceProfile::default());
    }

    #[test]
    fn test_address_endpoint() {
        let address = DeviceAddress::new("emulator-5554", "10.0.0.5", 9008);
        assert_eq!(address.endpoint(), "10.0.0.5:9008");
    }
}
