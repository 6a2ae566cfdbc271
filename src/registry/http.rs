//! HTTP Volume Registry
//!
//! Looks volumes up through the registry's REST API:
//! `GET {endpoint}/v1/volume/{name}` answers `{"volume": {...}}`.

use super::KIND_VOLUME;
use crate::domain::ports::{VolumeRecord, VolumeRegistry};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the HTTP registry client
#[derive(Debug, Clone)]
pub struct HttpRegistryConfig {
    /// Base URL of the registry, e.g. `http://trident-csi:8000`
    pub endpoint: String,
    /// Timeout for a single request
    pub timeout: Duration,
}

impl Default for HttpRegistryConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8000".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GetVolumeResponse {
    volume: VolumeRecord,
}

// =============================================================================
// HTTP Registry
// =============================================================================

/// Volume registry reached over HTTP
pub struct HttpVolumeRegistry {
    client: Client,
    endpoint: String,
}

impl HttpVolumeRegistry {
    pub fn new(config: HttpRegistryConfig) -> Result<Self> {
        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(Error::Configuration("registry endpoint is empty".into()));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("pv-upgrade-operator/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, endpoint })
    }

    fn volume_url(&self, name: &str) -> String {
        format!("{}/v1/volume/{}", self.endpoint, urlencoding::encode(name))
    }
}

#[async_trait]
impl VolumeRegistry for HttpVolumeRegistry {
    async fn get_volume(&self, name: &str) -> Result<VolumeRecord> {
        let url = self.volume_url(name);
        debug!(url = %url, "Fetching volume from registry");

        let response = self.client.get(&url).send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(Error::not_found(KIND_VOLUME, name));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::RegistryResponse {
                status: status.as_u16(),
                message,
            });
        }

        let body: GetVolumeResponse = response.json().await?;
        Ok(body.volume)
    }
}
