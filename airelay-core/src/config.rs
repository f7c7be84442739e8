use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::error::{CoreResult, RelayError};

/// Upstream AI completion endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UpstreamCfg {
    /// Base URL of the provider, e.g. https://api.openai.com
    pub base_url: String,
    /// Name of the environment variable that contains the API key.
    pub api_key_env: String,
    /// Default model for requests that do not name one.
    #[serde(default)]
    pub model: Option<String>,
}

impl UpstreamCfg {
    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> CoreResult<SecretString> {
        let raw = std::env::var(&self.api_key_env).map_err(|_| {
            RelayError::UpstreamConnect(format!(
                "environment variable '{}' is not set",
                self.api_key_env
            ))
        })?;
        Ok(SecretString::from(raw))
    }
}

fn default_reconnect_ms() -> u64 {
    crate::event::DEFAULT_RECONNECT_MS
}

fn default_connect_help() -> String {
    "the AI endpoint could not be reached, check base_url and the API key in the [upstream] \
     section of the relay configuration"
        .to_string()
}

/// Relay behavior knobs.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RelayCfg {
    /// Reconnect hint attached to data and sentinel frames (default 3000ms).
    #[serde(default = "default_reconnect_ms")]
    pub reconnect_ms: u64,
    /// Operator guidance appended to connect-failure error frames.
    #[serde(default = "default_connect_help")]
    pub connect_help: String,
}

impl Default for RelayCfg {
    fn default() -> Self {
        Self {
            reconnect_ms: default_reconnect_ms(),
            connect_help: default_connect_help(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds (default 600000ms; a streaming
    /// completion can legitimately run for minutes)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    600_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
    pub upstream: UpstreamCfg,
    /// Relay knobs (reconnect hint, help text). Missing section → defaults.
    #[serde(default)]
    pub relay: RelayCfg,
    /// HTTP client configuration (timeouts, pooling). Missing → defaults.
    #[serde(default)]
    pub http: HttpCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(RelayError::from)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| RelayError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| RelayError::Other(e.into()))?
            }
            Some("toml") => toml::from_str::<Self>(s).map_err(|e| RelayError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| RelayError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s).map_err(|e| RelayError::Other(e.into()))
                })?,
        };
        Ok(cfg)
    }
}
