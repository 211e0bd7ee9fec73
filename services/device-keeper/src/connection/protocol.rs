//! Inbound Message Interpreter
//!
//! Agents push JSON text frames on every channel. Only two of them mean
//! anything to the keeper: the per-platform "device ready" messages that
//! carry the forwarding port assigned to the device.

use serde_json::{Map, Value};

use crate::directory::adapter::{DeviceAddress, Platform};

/// `msg` value an Android agent sends once the device proxy is up
pub const ANDROID_READY_MSG: &str = "sas";
/// Field carrying the Android forwarding port
pub const ANDROID_PORT_FIELD: &str = "port";
/// `msg` value an iOS agent sends once the driver proxy is up
pub const IOS_READY_MSG: &str = "openDriver";
/// Field carrying the iOS driver proxy port
pub const IOS_PORT_FIELD: &str = "wda";

/// A frame the keeper acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentSignal {
    /// The device is reachable at the given forwarding address
    DeviceReady(DeviceAddress),
}

/// Decodes agent frames for one device
#[derive(Debug, Clone)]
pub struct MessageInterpreter {
    platform: Platform,
    host: String,
    device_id: String,
}

impl MessageInterpreter {
    /// `host` is the agent host; forwarding ports are opened there
    pub fn new(platform: Platform, host: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            platform,
            host: host.into(),
            device_id: device_id.into(),
        }
    }

    /// Interpret one text frame.
    ///
    /// Returns `Ok(None)` for anything that is not a ready signal with a
    /// usable port, and `Err` only when the payload is not JSON at all.
    pub fn interpret(&self, text: &str) -> serde_json::Result<Option<AgentSignal>> {
        let value: Value = serde_json::from_str(text)?;
        let Some(fields) = value.as_object() else {
            return Ok(None);
        };

        let (marker, port_field) = match self.platform {
            Platform::Android => (ANDROID_READY_MSG, ANDROID_PORT_FIELD),
            Platform::Ios => (IOS_READY_MSG, IOS_PORT_FIELD),
        };

        if fields.get("msg").and_then(Value::as_str) != Some(marker) {
            return Ok(None);
        }

        Ok(port_of(fields, port_field).map(|port| {
            AgentSignal::DeviceReady(DeviceAddress::new(
                self.device_id.clone(),
                self.host.clone(),
                port,
            ))
        }))
    }
}

// Missing, null, non-integer and out-of-range ports all read as "no port".
fn port_of(fields: &Map<String, Value>, name: &str) -> Option<u16> {
    fields
        .get(name)
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
        .filter(|p| *p != 0)
}
