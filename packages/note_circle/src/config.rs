//! Unified config (figment-deserialized from defaults / circle.toml / env vars)
//!
//! Three equivalent ways to configure:
//!
//!   circle.toml:     [websocket]
//!                    inactivity_timeout_secs = 900
//!
//!   env var:         CIRCLE_WEBSOCKET__INACTIVITY_TIMEOUT_SECS=900
//!                    (double underscore = section nesting)
//!
//!   CLI flags:       --host / --port override the resolved file config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
    #[serde(default)]
    pub websocket: WsFileConfig,
}

/// Listener knobs (lives under `[server]` in circle.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Extra origin accepted for WebSocket upgrades, alongside localhost
    /// and same-host origins.
    #[serde(default)]
    pub allowed_origin: Option<String>,
}

/// Session lifecycle knobs (lives under `[session]` in circle.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// How long a COMPLETE session is retained before the sweep evicts it.
    #[serde(default = "default_completed_retention_secs")]
    pub completed_retention_secs: u64,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            completed_retention_secs: default_completed_retention_secs(),
        }
    }
}

/// Per-connection knobs (lives under `[websocket]` in circle.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WsFileConfig {
    /// Disconnect peers with no inbound traffic for this long.
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    /// Heartbeat ping period. Must stay under the peer's silence window.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Outbound queue depth before a slow connection is dropped.
    #[serde(default = "default_outbound_buffer_msgs")]
    pub outbound_buffer_msgs: usize,
    /// Largest accepted inbound payload.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for WsFileConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            outbound_buffer_msgs: default_outbound_buffer_msgs(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl SessionFileConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn completed_retention(&self) -> Duration {
        Duration::from_secs(self.completed_retention_secs)
    }
}

impl WsFileConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

fn default_sweep_interval_secs() -> u64 {
    300
}
fn default_completed_retention_secs() -> u64 {
    3600
}
fn default_inactivity_timeout_secs() -> u64 {
    1800
}
fn default_ping_interval_secs() -> u64 {
    54
}
fn default_outbound_buffer_msgs() -> usize {
    256
}
fn default_max_message_bytes() -> usize {
    512 * 1024
}

/// Build a figment that layers: struct defaults → circle.toml → CIRCLE_*
/// env vars. Env vars use double-underscore for section nesting:
/// `CIRCLE_SERVER__PORT=9000` → `server.port = 9000`.
pub fn load_config(config_path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let toml_path = config_path.unwrap_or_else(|| Path::new("circle.toml"));

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(toml_path))
        .merge(Env::prefixed("CIRCLE_").split("__"))
}
