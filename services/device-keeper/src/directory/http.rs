//! Directory API Client
//!
//! HTTP client for the control plane's device registry API. Serves both as
//! the discovery [`TargetSource`] and as the [`DeviceAddressSink`].

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cli::config::DirectoryConfig;
use crate::directory::adapter::{ConnectionTarget, DeviceAddress, DeviceAddressSink, TargetSource};

#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
struct ForwardAddressBody<'a> {
    forward_address: &'a str,
}

pub struct DirectoryClient {
    client: reqwest::Client,
    base_url: String,
}

impl DirectoryClient {
    /// Create from the `[directory]` config section
    pub fn from_config(config: &DirectoryConfig, request_timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))
                    .context("Directory token is not a valid header value")?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    /// GET request
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;

        Self::unwrap_envelope(response)
            .await?
            .context("Empty response from API")
    }

    /// PUT request; writes may answer without a `data` payload
    async fn put<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Option<T>> {
        let url = self.url(path);
        let response = self
            .client
            .put(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;

        Self::unwrap_envelope(response).await
    }

    async fn unwrap_envelope<T: DeserializeOwned>(response: reqwest::Response) -> Result<Option<T>> {
        let status = response.status();
        let body: ApiResponse<T> = response
            .json()
            .await
            .with_context(|| format!("Malformed response body (status {})", status))?;

        if !body.success {
            if let Some(err) = body.error {
                bail!("[{}] {}", err.code, err.message);
            }
            bail!("API request failed with status {}", status);
        }

        Ok(body.data)
    }

    async fn write_forward_address(&self, device_id: &str, value: &str) -> Result<()> {
        let path = format!("/devices/{}/forward-address", device_id);
        let _: Option<serde_json::Value> = self
            .put(&path, &ForwardAddressBody { forward_address: value })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TargetSource for DirectoryClient {
    async fn online_targets(&self) -> Result<Vec<ConnectionTarget>> {
        self.get("/agents/devices/online").await
    }
}

#[async_trait]
impl DeviceAddressSink for DirectoryClient {
    async fn upsert(&self, address: &DeviceAddress) -> Result<()> {
        self.write_forward_address(&address.device_id, &address.endpoint())
            .await
            .with_context(|| format!("Failed to store forward address for {}", address.device_id))
    }

    async fn clear(&self, device_id: &str) -> Result<()> {
        self.write_forward_address(device_id, "")
            .await
            .with_context(|| format!("Failed to clear forward address for {}", device_id))
    }
}
