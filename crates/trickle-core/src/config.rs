//! trickle.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Key in the `[client]` table that is never exposed to the browser.
pub const INTERNAL_CLIENT_KEY: &str = "internal";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrickleConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub render: RenderConfig,
    /// Free-form settings handed to the client at bootstrap.
    #[serde(default)]
    pub client: toml::Table,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Budget for the body stage, measured from request start.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Upper bound on waiting for late data fetches. `0` waits forever.
    #[serde(default = "default_timeout_ms")]
    pub late_arrival_timeout_ms: u64,
    /// Query parameter that overrides `timeout_ms` for one request.
    #[serde(default = "default_debug_timeout_param")]
    pub debug_timeout_param: String,
    #[serde(default = "default_true")]
    pub allow_timeout_override: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            late_arrival_timeout_ms: default_timeout_ms(),
            debug_timeout_param: default_debug_timeout_param(),
            allow_timeout_override: true,
        }
    }
}

impl RenderConfig {
    pub fn render_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn late_arrival_timeout(&self) -> Option<Duration> {
        match self.late_arrival_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_debug_timeout_param() -> String {
    "_debug_render_timeout".to_string()
}

fn default_true() -> bool {
    true
}

impl TrickleConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: TrickleConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// The `[client]` table as JSON, minus the internal key.
    pub fn client_config_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (key, value) in &self.client {
            if key == INTERNAL_CLIENT_KEY {
                continue;
            }
            if let Ok(json) = serde_json::to_value(value) {
                map.insert(key.clone(), json);
            }
        }
        serde_json::Value::Object(map)
    }
}
