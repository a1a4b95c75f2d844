//! The network map: the authoritative, versioned snapshot of who this peer
//! should talk to, over what routes, with what DNS and firewall rules.
//!
//! CIDR prefixes and forwarding protocols are carried as strings and parsed
//! by the engine, so one malformed entry can be skipped without rejecting the
//! whole map.

use serde::{Deserialize, Serialize};

use crate::key::PeerKey;

/// Versioned snapshot from the management plane. Maps with a serial at or
/// below the last applied one are ignored by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkMap {
    /// Monotonic map version.
    pub serial: u64,
    pub local: LocalPeerConfig,
    #[serde(default)]
    pub peers: Vec<PeerDescriptor>,
    /// Distinguishes "management sent an empty peer list" from "management
    /// omitted the field" on control planes that elide empty collections.
    #[serde(default)]
    pub remote_peers_is_empty: bool,
    #[serde(default)]
    pub offline_peers: Vec<PeerDescriptor>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub firewall_rules: Vec<FirewallRule>,
    #[serde(default)]
    pub routes_firewall_rules: Vec<RouteFirewallRule>,
    /// See `routes_firewall_rules`: older control planes never send route
    /// rules and also never set this marker.
    #[serde(default)]
    pub routes_firewall_rules_is_empty: bool,
    #[serde(default)]
    pub forwarding_rules: Vec<ForwardRule>,
    #[serde(default)]
    pub relay: Option<RelayConfig>,
    #[serde(default)]
    pub stuns: Vec<String>,
    #[serde(default)]
    pub turns: Vec<String>,
}

/// Local interface settings carried in every map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalPeerConfig {
    /// Overlay address in CIDR form, e.g. `100.64.0.5/16`.
    pub address: String,
    #[serde(default)]
    pub fqdn: String,
    /// Lazy connection activation for this client, toggled by management.
    #[serde(default)]
    pub lazy_connection: Option<bool>,
}

/// One remote peer as the reconciler sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub key: PeerKey,
    /// CIDR prefixes routed through this peer.
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub fqdn: String,
    #[serde(default)]
    pub agent_version: String,
    #[serde(default)]
    pub ssh_public_key: Option<String>,
    #[serde(default)]
    pub pq_public_key: Option<String>,
}

/// A network route announced by management. `peer` is the gateway; when it
/// equals the local key this client serves the route, otherwise it subscribes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    /// Destination prefix in CIDR form.
    pub network: String,
    pub peer: PeerKey,
    #[serde(default)]
    pub metric: u32,
    #[serde(default)]
    pub masquerade: bool,
    /// High-availability group: routes sharing an id are served by several
    /// gateways and the client keeps one active.
    #[serde(default)]
    pub ha_group: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default)]
    pub service_enable: bool,
    #[serde(default)]
    pub nameserver_groups: Vec<NameserverGroup>,
    #[serde(default)]
    pub custom_zones: Vec<CustomZone>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameserverGroup {
    pub servers: Vec<String>,
    /// Domains forwarded to this group; empty means it is a default resolver.
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub primary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomZone {
    pub domain: String,
    #[serde(default)]
    pub records: Vec<DnsRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsRecord {
    pub name: String,
    pub rr_type: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Accept,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    All,
    Tcp,
    Udp,
    Icmp,
}

/// Peer ACL entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallRule {
    /// Peer the rule applies to; `None` means any peer.
    #[serde(default)]
    pub peer: Option<PeerKey>,
    pub direction: RuleDirection,
    pub action: RuleAction,
    pub protocol: Protocol,
    #[serde(default)]
    pub port: Option<u16>,
}

/// ACL entry for routed (non-peer) traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteFirewallRule {
    #[serde(default)]
    pub source_ranges: Vec<String>,
    pub action: RuleAction,
    /// Destination prefix in CIDR form.
    pub destination: String,
    pub protocol: Protocol,
    #[serde(default)]
    pub port_range: Option<(u16, u16)>,
}

/// Ingress forwarding rule: traffic arriving on `ingress_port` is translated
/// to `translated_peer:translated_port`. The protocol stays a string here so
/// the engine can skip entries carrying protocols it does not know.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRule {
    pub protocol: String,
    pub ingress_port: u16,
    pub translated_peer: PeerKey,
    pub translated_port: u16,
}

/// Pre-authenticated relay fallback announced by management.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub token: Option<RelayToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayToken {
    pub payload: String,
    pub signature: String,
}
