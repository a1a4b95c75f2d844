//! Engine configuration surface.
//!
//! The embedding client loads this from its own config store and hands it to
//! [`crate::engine::Engine::start`]. Everything has a default so a config
//! file only needs to name what it changes.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Local data-plane private key. Must not leave the machine: never
/// serialized back out and never shown in debug output.
#[derive(Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct PrivateKey(String);

impl PrivateKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Local data-plane port.
    pub wg_port: u16,
    /// Local private key; never serialized.
    #[serde(skip_serializing)]
    pub wg_private_key: PrivateKey,
    /// Local overlay address in CIDR form.
    pub wg_addr: String,
    /// Optional symmetric pre-shared key applied to every tunnel peer and
    /// used to sign ICE credentials on the signal plane.
    #[serde(skip_serializing)]
    pub pre_shared_key: Option<String>,
    /// UDP mux port for ICE host candidates; 0 means auto.
    pub udp_mux_port: u16,
    /// UDP mux port for server-reflexive candidates; 0 means auto.
    pub udp_mux_srflx_port: u16,
    /// `external[/internal-or-iface]` mappings; any parse failure voids the
    /// whole list.
    pub nat_external_ips: Vec<String>,
    /// Interfaces excluded from ICE candidate gathering.
    pub iface_black_list: Vec<String>,
    pub disable_ipv6_discovery: bool,
    /// Restart the engine when the host network changes.
    pub network_monitor: bool,
    pub rosenpass_enabled: bool,
    pub rosenpass_permissive: bool,
    pub server_ssh_allowed: bool,
    pub block_inbound: bool,
    pub disable_client_routes: bool,
    pub disable_server_routes: bool,
    pub disable_dns: bool,
    pub disable_firewall: bool,
    pub block_lan_access: bool,
    /// Default connection policy; management can override per map.
    pub lazy_connection_enabled: bool,
    /// Interval for refreshing DNS-derived routes.
    #[serde(with = "secs")]
    pub dns_route_interval: Duration,
    /// Ceiling on concurrent initial handshakes.
    pub admission_limit: usize,
    /// Persisted state document; `None` disables persistence. See
    /// [`crate::statefile::default_path`] for the conventional location.
    pub state_file: Option<std::path::PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            wg_port: 51820,
            wg_private_key: PrivateKey::default(),
            wg_addr: String::new(),
            pre_shared_key: None,
            udp_mux_port: 0,
            udp_mux_srflx_port: 0,
            nat_external_ips: Vec::new(),
            iface_black_list: Vec::new(),
            disable_ipv6_discovery: false,
            network_monitor: false,
            rosenpass_enabled: false,
            rosenpass_permissive: false,
            server_ssh_allowed: false,
            block_inbound: false,
            disable_client_routes: false,
            disable_server_routes: false,
            disable_dns: false,
            disable_firewall: false,
            block_lan_access: false,
            lazy_connection_enabled: false,
            dns_route_interval: Duration::from_secs(60),
            admission_limit: 200,
            state_file: None,
        }
    }
}

impl EngineConfig {
    /// SSH server keys are only installed when inbound access is allowed.
    pub fn ssh_server_enabled(&self) -> bool {
        self.server_ssh_allowed && !self.block_inbound
    }
}

mod secs {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// One parsed `external[/internal-or-iface]` NAT mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatMapping {
    pub external: IpAddr,
    pub internal: Option<NatInternal>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatInternal {
    Ip(IpAddr),
    Iface(String),
}

/// Parse the NAT external IP list. All-or-nothing: a single malformed entry
/// (bad IP, more than one `/`) rejects the entire list so no partial mapping
/// is ever applied.
pub fn parse_nat_external_ips(entries: &[String]) -> Result<Vec<NatMapping>, ConfigError> {
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut parts = entry.split('/');
        let external = parts.next().unwrap_or_default();
        let internal = parts.next();
        if parts.next().is_some() {
            return Err(ConfigError::NatMapping {
                entry: entry.clone(),
                reason: "more than one '/' separator".into(),
            });
        }
        let external: IpAddr = external.parse().map_err(|e| ConfigError::NatMapping {
            entry: entry.clone(),
            reason: format!("bad external address: {e}"),
        })?;
        let internal = match internal {
            None | Some("") => None,
            Some(raw) => Some(match raw.parse::<IpAddr>() {
                Ok(ip) => NatInternal::Ip(ip),
                Err(_) => NatInternal::Iface(raw.to_string()),
            }),
        };
        out.push(NatMapping { external, internal });
    }
    Ok(out)
}
