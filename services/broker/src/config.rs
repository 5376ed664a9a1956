//! Broker configuration loading.
//!
//! TOML is the sole config source; CLI flags may override individual fields
//! afterwards.  Out-of-range engine tunables are not rejected here — the
//! engine clamps them to safe defaults on construction.
//!
//! # Layout
//! ```toml
//! [broker]
//! host = "0.0.0.0"
//! port = 7270
//! max_open_conn = 50
//! buffer_size = 100
//! heartbeat_timeout_s = 60
//! token = ""
//!
//! [edge]
//! enabled = true
//! bind = "0.0.0.0:7280"
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

/// Top-level broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub max_open_conn: usize,
    pub buffer_size: usize,
    pub heartbeat_timeout_s: u64,
    pub token: String,
    pub edge: EdgeConfig,
}

/// HTTP producer edge settings.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            host: "0.0.0.0".to_owned(),
            port: 7270,
            max_open_conn: 50,
            buffer_size: 100,
            heartbeat_timeout_s: 60,
            token: String::new(),
            edge: EdgeConfig {
                enabled: true,
                bind: "0.0.0.0:7280".to_owned(),
            },
        }
    }
}

impl BrokerConfig {
    /// Translate into the engine's config (which applies its own clamping).
    pub fn engine_config(&self) -> mq_engine::Config {
        mq_engine::Config {
            host: self.host.clone(),
            port: self.port,
            max_open_conn: self.max_open_conn,
            buffer_size: self.buffer_size,
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_s),
            token: self.token.clone(),
            ..mq_engine::Config::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    broker: Option<RawBrokerSection>,
    edge: Option<RawEdgeSection>,
}

#[derive(Debug, Deserialize)]
struct RawBrokerSection {
    host: Option<String>,
    port: Option<u16>,
    max_open_conn: Option<usize>,
    buffer_size: Option<usize>,
    heartbeat_timeout_s: Option<u64>,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEdgeSection {
    enabled: Option<bool>,
    bind: Option<String>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load broker config from a TOML file.
pub fn load_config_from_path(path: &Path) -> Result<BrokerConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load broker config from a TOML string.  Every field is optional and falls
/// back to its default.
pub fn load_config_from_str(toml_str: &str) -> Result<BrokerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let defaults = BrokerConfig::default();

    let broker = raw.broker.unwrap_or(RawBrokerSection {
        host: None,
        port: None,
        max_open_conn: None,
        buffer_size: None,
        heartbeat_timeout_s: None,
        token: None,
    });
    let edge = raw.edge.unwrap_or(RawEdgeSection {
        enabled: None,
        bind: None,
    });

    Ok(BrokerConfig {
        host: broker.host.unwrap_or(defaults.host),
        port: broker.port.unwrap_or(defaults.port),
        max_open_conn: broker.max_open_conn.unwrap_or(defaults.max_open_conn),
        buffer_size: broker.buffer_size.unwrap_or(defaults.buffer_size),
        heartbeat_timeout_s: broker
            .heartbeat_timeout_s
            .unwrap_or(defaults.heartbeat_timeout_s),
        token: broker.token.unwrap_or(defaults.token),
        edge: EdgeConfig {
            enabled: edge.enabled.unwrap_or(defaults.edge.enabled),
            bind: edge.bind.unwrap_or(defaults.edge.bind),
        },
    })
}
