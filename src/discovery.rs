//! OSCQuery discovery over HTTP.
//!
//! Two independent GET requests against the remote's OSCQuery port:
//!
//! - `/?HOST_INFO`: transport details (OSC port override, push extension).
//! - `/`: the parameter structure, a JSON object.
//!
//! Each request is bounded by [`constants::DISCOVERY_TIMEOUT`]. A failure of
//! one phase does not prevent the other from being attempted.

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde_json::Value as Json;

use crate::constants;

/// Host information advertised by the remote.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostInfo {
    /// Display name of the remote.
    pub name: Option<String>,
    /// Port the remote receives OSC on, when it differs from the query port.
    pub osc_port: Option<u16>,
    /// OSC transport (`"UDP"` or `"TCP"`).
    pub osc_transport: Option<String>,
    /// Port of the push channel, when it differs from the query port.
    pub ws_port: Option<u16>,
    /// Whether the remote supports LISTEN/IGNORE push notifications.
    pub listen: bool,
}

impl HostInfo {
    /// Read the fields this crate uses; unknown fields are ignored and
    /// malformed ones are treated as absent.
    pub fn from_json(json: &Json) -> Self {
        let port = |key: &str| {
            json.get(key)
                .and_then(Json::as_u64)
                .and_then(|p| u16::try_from(p).ok())
        };

        Self {
            name: json.get("NAME").and_then(Json::as_str).map(str::to_string),
            osc_port: port("OSC_PORT"),
            osc_transport: json
                .get("OSC_TRANSPORT")
                .and_then(Json::as_str)
                .map(str::to_string),
            ws_port: port("WS_PORT"),
            listen: json
                .get("EXTENSIONS")
                .and_then(|e| e.get("LISTEN"))
                .and_then(Json::as_bool)
                .unwrap_or(false),
        }
    }
}

/// Blocking discovery client for one remote.
#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    client: Client,
    base_url: String,
}

impl DiscoveryClient {
    /// Creates a client for `http://{host}:{port}`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        Self::with_base_url(format!("http://{host}:{port}"))
    }

    /// Creates a client for an explicit base URL (no trailing slash).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(constants::DISCOVERY_TIMEOUT)
            .user_agent(constants::user_agent())
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch `/?HOST_INFO`.
    ///
    /// # Errors
    ///
    /// Returns an error on timeout, non-success status or a body that is not
    /// a JSON object.
    pub fn host_info(&self) -> Result<HostInfo> {
        let json = self.get_object(&format!("{}/?HOST_INFO", self.base_url))?;
        Ok(HostInfo::from_json(&json))
    }

    /// Fetch the parameter structure from `/`.
    ///
    /// # Errors
    ///
    /// Returns an error on timeout, non-success status or a body that is not
    /// a JSON object.
    pub fn structure(&self) -> Result<Json> {
        self.get_object(&format!("{}/", self.base_url))
    }

    fn get_object(&self, url: &str) -> Result<Json> {
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("Request to {url} failed"))?;

        if !response.status().is_success() {
            anyhow::bail!("{url} returned {}", response.status());
        }

        let json: Json = response
            .json()
            .with_context(|| format!("Invalid JSON from {url}"))?;
        if !json.is_object() {
            anyhow::bail!("{url} did not return a JSON object");
        }
        Ok(json)
    }
}
