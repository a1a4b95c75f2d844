//! Control-plane frames.
//!
//! The management service pushes [`SyncResponse`] frames over a long-lived
//! stream. A frame may carry server configuration, a fresh network map, or
//! both. The client announces itself once on attach with a [`Meta`].

use serde::{Deserialize, Serialize};

use crate::map::{NetworkMap, RelayConfig};

/// One frame from the management stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(default)]
    pub config: Option<ControlConfig>,
    #[serde(default)]
    pub network_map: Option<NetworkMap>,
    #[serde(default)]
    pub checks: Vec<Check>,
}

/// Infrastructure configuration pushed out-of-band of the map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default)]
    pub stuns: Vec<String>,
    #[serde(default)]
    pub turns: Vec<String>,
    #[serde(default)]
    pub relay: Option<RelayConfig>,
    #[serde(default)]
    pub flow: Option<FlowConfig>,
}

/// Traffic-flow telemetry settings (consumed by an out-of-scope collector;
/// carried here so config updates serialize with the rest).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    pub url: String,
    #[serde(default)]
    pub interval_secs: u64,
}

/// Posture check requested by management.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    #[serde(default)]
    pub files: Vec<String>,
}

/// Client self-description sent once when the control stream attaches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub hostname: String,
    pub os: String,
    pub agent_version: String,
    #[serde(default)]
    pub flags: ClientFlags,
}

/// Feature flags the client advertises to management.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ClientFlags {
    #[serde(default)]
    pub lazy_connection: bool,
    #[serde(default)]
    pub server_ssh_allowed: bool,
    #[serde(default)]
    pub rosenpass: bool,
}
