//! HTTP clients for talking to peer nodes and to the external application.
//!
//! # Usage
//!
//! ```rust,no_run
//! use overseer_core::client::PeerClient;
//! use overseer_core::types::CreateWatchRequest;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> overseer_core::Result<()> {
//!     let child = PeerClient::new("slave1", "http://10.0.0.2:8021", Duration::from_secs(10))?;
//!     let req = CreateWatchRequest {
//!         match_ref: "42".into(),
//!         participant_a: "Alice".into(),
//!         participant_b: "Bob".into(),
//!     };
//!     child.create_watch("somestreamer", "test", &req).await?;
//!     Ok(())
//! }
//! ```

use crate::error::{Error, Result};
use crate::types::*;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::debug;

/// Client for one neighbouring watcher node (parent or child)
#[derive(Debug, Clone)]
pub struct PeerClient {
    /// Configured peer name, used in logs and as the record owner
    name: String,
    base_url: String,
    client: reqwest::Client,
}

impl PeerClient {
    /// Create a client with a bounded per-request timeout
    pub fn new(name: impl Into<String>, base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client: build_client(timeout)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Stream Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Ask the peer to take (or attach to) a stream
    pub async fn create_watch(
        &self,
        handle: &str,
        game_kind: &str,
        req: &CreateWatchRequest,
    ) -> Result<WatchSession> {
        self.request(reqwest::Method::PUT, &stream_path(handle, game_kind), Some(req))
            .await
    }

    /// Get a stream record as the peer sees it
    pub async fn get_watch(&self, handle: &str, game_kind: &str) -> Result<Option<WatchSession>> {
        let result: Result<WatchSession> = self
            .request(
                reqwest::Method::GET,
                &stream_path(handle, game_kind),
                Option::<()>::None,
            )
            .await;
        match result {
            Ok(s) => Ok(Some(s)),
            Err(Error::PeerRejected { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Relay a result or an event towards the root
    pub async fn report(&self, handle: &str, game_kind: &str, req: &ReportRequest) -> Result<()> {
        let _: serde_json::Value = self
            .request(reqwest::Method::PATCH, &stream_path(handle, game_kind), Some(req))
            .await?;
        Ok(())
    }

    /// Delete a stream on the peer; a record that is already gone is not an error
    pub async fn delete_watch(&self, handle: &str, game_kind: &str) -> Result<bool> {
        let result: Result<serde_json::Value> = self
            .request(
                reqwest::Method::DELETE,
                &stream_path(handle, game_kind),
                Option::<()>::None,
            )
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(Error::PeerRejected { status: 404, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Aggregated load of the peer's subtree
    pub async fn load(&self) -> Result<LoadReport> {
        self.request(reqwest::Method::GET, "/load", Option::<()>::None)
            .await
    }

    async fn request<T: DeserializeOwned, B: Serialize>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<B>,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!(peer = %self.name, %method, %url, "Peer request");

        let mut req = self.client.request(method, &url);
        if let Some(ref b) = body {
            req = req.json(b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| Error::peer_unreachable(&self.name, e))?;
        decode(&self.name, resp).await
    }
}

/// Client for the external application that owns the matches
#[derive(Debug, Clone)]
pub struct AppClient {
    base_url: String,
    client: reqwest::Client,
}

impl AppClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: build_client(timeout)?,
        })
    }

    /// Record the outcome of one match
    pub async fn post_result(&self, match_ref: &str, result: &MatchResult) -> Result<()> {
        self.post(&format!("/matches/{}/result", match_ref), result)
            .await
    }

    /// Attach a human-readable event to one match
    pub async fn post_event(&self, match_ref: &str, text: &str) -> Result<()> {
        let body = serde_json::json!({ "text": text });
        self.post(&format!("/matches/{}/events", match_ref), &body)
            .await
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "Application request");

        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::peer_unreachable("app", e))?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(Error::PeerRejected {
                peer: "app".to_string(),
                status: status.as_u16(),
                body,
            })
        }
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))
}

fn stream_path(handle: &str, game_kind: &str) -> String {
    format!("/streams/{}/{}", handle, game_kind)
}

async fn decode<T: DeserializeOwned>(peer: &str, resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        // DELETE answers with an empty body
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::peer_unreachable(peer, e))?;
        let bytes: &[u8] = if bytes.is_empty() { b"null" } else { &bytes };
        Ok(serde_json::from_slice(bytes)?)
    } else {
        let body = resp.text().await.unwrap_or_default();
        Err(Error::PeerRejected {
            peer: peer.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}
