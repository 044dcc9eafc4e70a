//! Server transport.
//!
//! The agent speaks a small JSON protocol: registration, heartbeats,
//! policy sync, event delivery, and unregistration. Everything goes
//! through the [`ServerTransport`] trait so tests can substitute a
//! recording mock; [`HttpTransport`] is the reqwest-backed production
//! implementation. Transport failures are recoverable by design -- the
//! periodic loops simply retry on their next tick.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use opendlp_core::event::EventEnvelope;

/// Body of `POST /agents`.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub name: String,
    pub hostname: String,
    pub os: String,
    pub os_version: String,
    pub ip_address: String,
    pub version: String,
}

/// Body of `PUT /agents/{id}/heartbeat`.
#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat {
    pub timestamp: DateTime<Utc>,
    pub ip_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_version: Option<String>,
}

/// Body of `POST /agents/{id}/policies/sync`.
#[derive(Debug, Clone, Serialize)]
pub struct PolicySyncRequest {
    pub platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_version: Option<String>,
}

/// Outcome of a policy sync round-trip.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncResponse {
    /// The installed bundle is current.
    UpToDate,
    /// A new bundle; the raw JSON is handed to the bundle parser.
    Bundle(String),
}

/// Outbound protocol surface toward the DLP server.
#[async_trait]
pub trait ServerTransport: Send + Sync {
    async fn register(&self, registration: &AgentRegistration) -> Result<()>;
    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<()>;
    async fn sync_policies(&self, request: &PolicySyncRequest) -> Result<SyncResponse>;
    async fn post_event(&self, envelope: &EventEnvelope) -> Result<()>;
    async fn unregister(&self) -> Result<()>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    base_url: String,
    agent_id: String,
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: &str, agent_id: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("OpenDLP-Agent/1.0")
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent_id: agent_id.to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl ServerTransport for HttpTransport {
    async fn register(&self, registration: &AgentRegistration) -> Result<()> {
        let response = self
            .http
            .post(self.url("/agents"))
            .json(registration)
            .send()
            .await
            .context("registering agent")?;
        let status = response.status().as_u16();
        if status == 200 || status == 201 {
            Ok(())
        } else {
            bail!("agent registration rejected: HTTP {status}");
        }
    }

    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        let response = self
            .http
            .put(self.url(&format!("/agents/{}/heartbeat", self.agent_id)))
            .json(heartbeat)
            .send()
            .await
            .context("sending heartbeat")?;
        debug!(status = response.status().as_u16(), "heartbeat sent");
        Ok(())
    }

    async fn sync_policies(&self, request: &PolicySyncRequest) -> Result<SyncResponse> {
        let response = self
            .http
            .post(self.url(&format!("/agents/{}/policies/sync", self.agent_id)))
            .json(request)
            .send()
            .await
            .context("syncing policies")?;
        let status = response.status().as_u16();
        if status != 200 {
            bail!("policy sync failed: HTTP {status}");
        }
        let body = response.text().await.context("reading sync response")?;
        Ok(decode_sync_response(&body)?)
    }

    async fn post_event(&self, envelope: &EventEnvelope) -> Result<()> {
        let response = self
            .http
            .post(self.url("/events"))
            .json(envelope)
            .send()
            .await
            .context("posting event")?;
        let status = response.status().as_u16();
        if status == 200 || status == 201 {
            Ok(())
        } else {
            bail!("event rejected: HTTP {status}");
        }
    }

    async fn unregister(&self) -> Result<()> {
        self.http
            .delete(self.url(&format!("/agents/{}/unregister", self.agent_id)))
            .send()
            .await
            .context("unregistering agent")?;
        Ok(())
    }
}

/// Distinguish `{"status":"up_to_date"}` from a full bundle body.
pub fn decode_sync_response(body: &str) -> Result<SyncResponse> {
    let value: serde_json::Value =
        serde_json::from_str(body).context("malformed sync response")?;
    if value.get("status").and_then(|s| s.as_str()) == Some("up_to_date") {
        Ok(SyncResponse::UpToDate)
    } else {
        Ok(SyncResponse::Bundle(body.to_string()))
    }
}

/// Local address the default route would use, discovered by "connecting"
/// a UDP socket. Never sends a packet. Falls back to loopback.
pub fn outbound_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| "127.0.0.1".to_string())
}
