//! Connection keys and agent URL resolution.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::directory::adapter::ConnectionTarget;

/// Logical stream opened per device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Main,
    Terminal,
    Screen,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Main, Channel::Terminal, Channel::Screen];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Main => "main",
            Channel::Terminal => "terminal",
            Channel::Screen => "screen",
        }
    }

    /// URL segment inserted before the secret key; the main channel has none
    fn path_segment(&self) -> Option<&'static str> {
        match self {
            Channel::Main => None,
            Channel::Terminal => Some("terminal"),
            Channel::Screen => Some("screen"),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry key: one connection per device and channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub device_id: String,
    pub channel: Channel,
}

impl ConnectionKey {
    pub fn new(device_id: impl Into<String>, channel: Channel) -> Self {
        Self {
            device_id: device_id.into(),
            channel,
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_id, self.channel)
    }
}

/// Build the agent WebSocket URL for one channel of a target.
///
/// `ws://{host}:{port}/websockets/{platform}/[{channel}/]{secret}/{device}/{token}`
pub fn agent_url(target: &ConnectionTarget, channel: Channel) -> String {
    let mut url = format!(
        "ws://{}:{}/websockets/{}/",
        target.host, target.port, target.platform
    );
    if let Some(segment) = channel.path_segment() {
        url.push_str(segment);
        url.push('/');
    }
    url.push_str(&format!(
        "{}/{}/{}",
        target.secret_key, target.device_id, target.auth_token
    ));
    url
}
