//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Environment variable overriding the API base URL.
pub const API_URL_ENV: &str = "PINMARK_API_URL";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),
}

/// Engine settings. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the image API.
    pub api_url: String,
    /// Brush diameter in image pixels.
    pub brush_radius: f64,
    /// Quiet period before a mask push, in milliseconds.
    pub push_delay_ms: u64,
    /// First reconnect delay, in milliseconds.
    pub reconnect_min_ms: u64,
    /// Reconnect delay ceiling, in milliseconds.
    pub reconnect_max_ms: u64,
    /// Drawing surface size used until an image is loaded.
    pub surface_width: u32,
    pub surface_height: u32,
    /// Viewer page that share links point at; the API base when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_base: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:3030".to_string(),
            brush_radius: 4.0,
            push_delay_ms: 100,
            reconnect_min_ms: 1000,
            reconnect_max_ms: 10_000,
            surface_width: 800,
            surface_height: 600,
            share_base: None,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Default config file path.
    ///
    /// On Unix: `~/.config/pinmark/config.json`
    pub fn default_location() -> Option<PathBuf> {
        dirs::config_dir()
            .or_else(dirs::home_dir)
            .map(|base| base.join("pinmark").join("config.json"))
    }

    /// Load from the default location, falling back to defaults, then apply
    /// the environment override.
    pub fn load_or_default() -> Self {
        let config = match Self::default_location() {
            Some(path) if path.exists() => Self::load(&path).unwrap_or_else(|e| {
                log::warn!("Ignoring config at {}: {}", path.display(), e);
                Self::default()
            }),
            _ => Self::default(),
        };
        config.with_api_override(std::env::var(API_URL_ENV).ok())
    }

    /// Replace the API base URL when an override is present.
    pub fn with_api_override(mut self, api_url: Option<String>) -> Self {
        if let Some(url) = api_url.filter(|u| !u.trim().is_empty()) {
            log::info!("API URL overridden: {}", url);
            self.api_url = url;
        }
        self
    }

    pub fn push_delay(&self) -> Duration {
        Duration::from_millis(self.push_delay_ms)
    }

    pub fn reconnect_min(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    /// Base URL for share links.
    pub fn share_base(&self) -> &str {
        self.share_base.as_deref().unwrap_or(&self.api_url)
    }

    pub fn endpoints(&self) -> Result<Endpoints, ConfigError> {
        Endpoints::from_api(&self.api_url)
    }
}

/// Resolved request and live-channel URLs.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoints {
    api: Url,
    ws: Url,
}

impl Endpoints {
    /// Derive endpoints from the API base; the channel base swaps the scheme.
    pub fn from_api(api: &str) -> Result<Self, ConfigError> {
        let api = Url::parse(api).map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;
        let ws_scheme = match api.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(ConfigError::InvalidUrl(format!(
                    "unsupported scheme: {}",
                    other
                )));
            }
        };

        let mut ws = api.clone();
        ws.set_scheme(ws_scheme)
            .map_err(|_| ConfigError::InvalidUrl(format!("cannot derive {} URL", ws_scheme)))?;
        Ok(Self { api, ws })
    }

    fn base(url: &Url) -> &str {
        url.as_str().trim_end_matches('/')
    }

    /// `POST` target for new images.
    pub fn images(&self) -> String {
        format!("{}/pic", Self::base(&self.api))
    }

    pub fn image(&self, id: &str) -> String {
        format!("{}/pic/{}", Self::base(&self.api), id)
    }

    pub fn comments(&self, id: &str) -> String {
        format!("{}/pic/{}/comments", Self::base(&self.api), id)
    }

    /// Live channel for one image.
    pub fn channel(&self, id: &str) -> String {
        format!("{}/pic/{}", Self::base(&self.ws), id)
    }
}
