//! Configuration loading and persistence.
//!
//! Settings are read from `config.json` in the platform config directory,
//! then `OSCQUERY_*` environment variables are applied on top. The CLI can
//! override individual fields after loading.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::constants;

/// Settings for one mirrored remote.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// When false, nothing is sent to the remote and the push channel stays closed.
    pub enabled: bool,
    /// Talk to `127.0.0.1` instead of `remote_host`.
    pub use_local: bool,
    /// Remote host name or address.
    pub remote_host: String,
    /// Remote OSCQuery (HTTP) port.
    pub remote_port: u16,
    /// Custom OSC port; `None` sends OSC to `remote_port`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub osc_port: Option<u16>,
    /// Keep current values instead of schema values when resyncing.
    pub keep_values_on_sync: bool,
    /// Log every received message at info level.
    pub log_incoming: bool,
    /// Log every sent message at info level.
    pub log_outgoing: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            use_local: true,
            remote_host: constants::LOCAL_HOST.to_string(),
            remote_port: constants::DEFAULT_REMOTE_PORT,
            osc_port: None,
            keep_values_on_sync: false,
            log_incoming: false,
            log_outgoing: false,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `OSCQUERY_MIRROR_CONFIG_DIR` overrides the platform config dir.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("OSCQUERY_MIRROR_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("oscquery-mirror")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    /// A missing or unreadable file falls back to defaults.
    pub fn load() -> Result<Self> {
        let path = Self::config_dir()?.join("config.json");
        let mut config = Self::load_from(&path).unwrap_or_else(|e| {
            log::debug!("Using default config: {e:#}");
            Self::default()
        });
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load configuration from an explicit file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Apply `OSCQUERY_*` overrides using `lookup` to read variables.
    ///
    /// Unparsable values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("OSCQUERY_HOST") {
            self.remote_host = host.trim().to_string();
            self.use_local = false;
        }

        if let Some(port) = lookup("OSCQUERY_PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.remote_port = port,
                Err(e) => log::warn!("Ignoring OSCQUERY_PORT={port}: {e}"),
            }
        }

        if let Some(port) = lookup("OSCQUERY_OSC_PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.osc_port = Some(port),
                Err(e) => log::warn!("Ignoring OSCQUERY_OSC_PORT={port}: {e}"),
            }
        }

        if let Some(keep) = lookup("OSCQUERY_KEEP_VALUES") {
            self.keep_values_on_sync = matches!(keep.as_str(), "1" | "true" | "yes");
        }
    }

    /// Persists the configuration to the default location.
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_dir()?.join("config.json");
        self.save_to(&path)?;
        Ok(path)
    }

    /// Persists the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write config {}", path.display()))
    }

    /// Host that discovery and OSC traffic go to.
    pub fn target_host(&self) -> &str {
        if self.use_local {
            constants::LOCAL_HOST
        } else {
            &self.remote_host
        }
    }
}
