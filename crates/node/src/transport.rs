//! # HTTP Transport
//!
//! Production [`OverlayClient`] and the small JSON helpers the DHT
//! client, scheduler, and executor use for outbound calls. Every call
//! carries its own bounded timeout; a slow peer costs at most that
//! timeout and never wedges a background loop.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use edgemesh_common::ChordId;

use crate::chord::{OverlayClient, TransportError};
use crate::registry::PeerAddr;

/// Timeout for overlay maintenance calls (find_successor forwards,
/// predecessor probes, notify).
pub const OVERLAY_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for DHT store/lookup and peer gossip calls.
pub const DHT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect/overall timeout for task dispatch.
pub const DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Reqwest-backed transport shared by every outbound path.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        // Per-request timeouts are set at the call sites; the builder
        // only pins the connect phase.
        let client = reqwest::Client::builder()
            .connect_timeout(OVERLAY_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    fn err(url: &str, e: impl std::fmt::Display) -> TransportError {
        TransportError::Failed {
            url: url.to_string(),
            reason: e.to_string(),
        }
    }

    /// GET returning JSON.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<T, TransportError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Self::err(url, e))?;
        if !response.status().is_success() {
            return Err(Self::err(url, format!("status {}", response.status())));
        }
        response.json().await.map_err(|e| Self::err(url, e))
    }

    /// POST a JSON body, returning the JSON response.
    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<T, TransportError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Self::err(url, e))?;
        if !response.status().is_success() {
            return Err(Self::err(url, format!("status {}", response.status())));
        }
        response.json().await.map_err(|e| Self::err(url, e))
    }

    /// POST a JSON body, ignoring the response payload.
    pub async fn post_json_ack<B: Serialize>(
        &self,
        url: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Self::err(url, e))?;
        if !response.status().is_success() {
            return Err(Self::err(url, format!("status {}", response.status())));
        }
        Ok(())
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OverlayClient for HttpTransport {
    async fn find_successor(
        &self,
        base_url: &str,
        id: &ChordId,
    ) -> Result<PeerAddr, TransportError> {
        let url = format!("{}/chord/find_successor?id={}", base_url, id.to_hex());
        self.get_json(&url, OVERLAY_TIMEOUT).await
    }

    async fn successor(&self, base_url: &str) -> Result<Option<PeerAddr>, TransportError> {
        let url = format!("{}/chord/successor", base_url);
        self.get_json(&url, OVERLAY_TIMEOUT).await
    }

    async fn predecessor(&self, base_url: &str) -> Result<Option<PeerAddr>, TransportError> {
        let url = format!("{}/chord/predecessor", base_url);
        self.get_json(&url, OVERLAY_TIMEOUT).await
    }

    async fn notify(&self, base_url: &str, from: &PeerAddr) -> Result<(), TransportError> {
        let url = format!("{}/chord/notify", base_url);
        self.post_json_ack(&url, from, OVERLAY_TIMEOUT).await
    }
}
