//! Device Pool Client
//!
//! HTTP client for the downstream device pool. Two calls: register a
//! reachable device and heartbeat a batch of devices. Both authenticate
//! with a static `X-Access-Token`.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::cli::config::DevicePoolConfig;
use crate::directory::adapter::{ConnectionTarget, DeviceAddress, Platform};
use crate::sync::{DeviceSync, SyncError, SyncOutcome};

const ACCESS_TOKEN_HEADER: &str = "X-Access-Token";
const REGISTER_PATH: &str = "/device/devicePhone/add";
const HEARTBEAT_PATH: &str = "/device/devicePhone/sendheart";

/// Body of a register call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: String,
    pub device_type: Platform,
    pub online: bool,
    pub is_busy: bool,
    pub used_counts: u32,
    pub busy_timeout: u64,
    pub remote_url: String,
    pub provider_id: String,
    pub provider_ip: String,
    pub heart_time: i64,
    pub name: Option<String>,
    pub version: Option<String>,
    pub resolution: Option<String>,
    pub location: String,
    pub is_server: bool,
    pub device_group: String,
    pub tidevice_socket: Option<String>,
}

/// Body of a heartbeat call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRecord {
    pub provider_id: String,
    pub ids: Vec<String>,
}

#[derive(Debug)]
pub struct DevicePoolClient {
    client: reqwest::Client,
    base_url: Option<String>,
    settings: DevicePoolConfig,
    last_known: DashMap<String, String>,
}

impl DevicePoolClient {
    /// Create from the `[device_pool]` config section. An empty base URL
    /// yields a client whose calls all fail with [`SyncError::NotConfigured`].
    pub fn from_config(config: &DevicePoolConfig) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            ACCESS_TOKEN_HEADER,
            HeaderValue::from_str(&config.token).map_err(SyncError::InvalidToken)?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let base_url = Some(config.base_url.trim().trim_end_matches('/'))
            .filter(|u| !u.is_empty())
            .map(str::to_string);

        Ok(Self {
            client,
            base_url,
            settings: config.clone(),
            last_known: DashMap::new(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }

    fn endpoint(&self, path: &str) -> Result<String, SyncError> {
        let base = self.base_url.as_deref().ok_or(SyncError::NotConfigured)?;
        Ok(format!("{}{}", base, path))
    }

    fn provider_id(&self, agent_host: &str) -> String {
        format!("{}-{}", self.settings.provider_prefix, agent_host)
    }

    /// Build the register body for a device reachable at `address`
    pub fn record_for(&self, target: &ConnectionTarget, address: &DeviceAddress) -> DeviceRecord {
        let remote_url = match target.platform {
            Platform::Android => address.endpoint(),
            Platform::Ios => format!("http://{}", address.endpoint()),
        };

        DeviceRecord {
            id: target.device_id.clone(),
            device_type: target.platform,
            online: true,
            is_busy: false,
            used_counts: 0,
            busy_timeout: self.settings.busy_timeout_secs,
            remote_url,
            provider_id: self.provider_id(&target.host),
            provider_ip: target.host.clone(),
            heart_time: Utc::now().timestamp_millis(),
            name: target.profile.model.clone(),
            version: target.profile.version.clone(),
            resolution: target.profile.resolution.clone(),
            location: self.settings.location.clone(),
            is_server: false,
            device_group: self.settings.device_group.clone(),
            tidevice_socket: target.profile.tidevice_socket.clone(),
        }
    }

    async fn check(response: reqwest::Response) -> Result<String, SyncError> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(SyncError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl DeviceSync for DevicePoolClient {
    async fn device_ready(
        &self,
        target: &ConnectionTarget,
        address: &DeviceAddress,
    ) -> Result<SyncOutcome, SyncError> {
        let url = self.endpoint(REGISTER_PATH)?;
        let endpoint = address.endpoint();

        // Claim the address before writing so concurrent reports from
        // sibling channels collapse into one request.
        match self.last_known.entry(target.device_id.clone()) {
            Entry::Occupied(e) if e.get() == &endpoint => {
                debug!(device_id = %target.device_id, address = %endpoint, "Device pool already up to date");
                return Ok(SyncOutcome::Unchanged);
            }
            Entry::Occupied(mut e) => {
                e.insert(endpoint.clone());
            }
            Entry::Vacant(e) => {
                e.insert(endpoint.clone());
            }
        }

        let record = self.record_for(target, address);
        let result = match self.client.post(&url).json(&record).send().await {
            Ok(response) => Self::check(response).await,
            Err(e) => Err(SyncError::from(e)),
        };

        match result {
            Ok(body) => {
                info!(device_id = %target.device_id, remote_url = %record.remote_url, response = %body, "Device synced to pool");
                Ok(SyncOutcome::Written)
            }
            Err(e) => {
                self.last_known
                    .remove_if(&target.device_id, |_, v| v == &endpoint);
                Err(e)
            }
        }
    }

    async fn heartbeat(&self, agent_host: &str, device_ids: &[String]) -> Result<(), SyncError> {
        let url = self.endpoint(HEARTBEAT_PATH)?;
        let record = HeartbeatRecord {
            provider_id: self.provider_id(agent_host),
            ids: device_ids.to_vec(),
        };

        let response = self.client.put(&url).json(&record).send().await?;
        Self::check(response).await?;
        debug!(provider_id = %record.provider_id, devices = record.ids.len(), "Heartbeat sent to pool");
        Ok(())
    }

    fn forget(&self, device_id: &str) {
        self.last_known.remove(device_id);
    }
}
