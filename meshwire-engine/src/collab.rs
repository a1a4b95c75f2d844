//! Capability traits for the engine's collaborators.
//!
//! The engine owns one implementation per concern, selected by the embedding
//! client at bootstrap. Sessions and the reconciler only ever see these
//! traits; nothing in the core opens sockets or touches the host except the
//! health probe.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::sync::{mpsc, oneshot};

use meshwire_proto::PeerKey;
use meshwire_proto::control::{Meta, SyncResponse};
use meshwire_proto::map::{DnsConfig, FirewallRule, RelayConfig, RouteFirewallRule};
use meshwire_proto::signal::SignalMessage;

use crate::error::{DialError, EngineError, StreamError};
use crate::ice::IceServers;
use crate::routes::RouteEntry;

/// One peer entry in the tunnel device's peer table.
#[derive(Debug, Clone)]
pub struct TunnelPeer {
    pub key: PeerKey,
    pub allowed_ips: Vec<IpNet>,
    /// Data-plane endpoint; `None` until negotiation pins one down, and for
    /// relayed paths where the relay client owns the socket.
    pub endpoint: Option<SocketAddr>,
    pub keepalive: Option<Duration>,
    pub preshared_key: Option<String>,
}

/// Per-peer counters read from the tunnel device.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub last_handshake: Option<chrono::DateTime<chrono::Utc>>,
}

/// The local encrypted tunnel interface. The device serializes its own
/// mutations; the engine only coordinates who calls what.
#[async_trait]
pub trait TunnelInterface: Send + Sync {
    /// Current overlay address. Fails with
    /// [`EngineError::TunnelNotInitialized`] before the device is up.
    fn address(&self) -> Result<IpNet, EngineError>;

    async fn set_address(&self, addr: IpNet) -> Result<(), EngineError>;

    /// Insert or update a peer entry. Upsert semantics: an existing entry's
    /// allowed IPs and endpoint are replaced.
    async fn upsert_peer(&self, peer: TunnelPeer) -> Result<(), EngineError>;

    async fn remove_peer(&self, key: &PeerKey) -> Result<(), EngineError>;

    async fn peer_stats(&self, key: &PeerKey) -> Option<TransferStats>;
}

/// Host firewall manager.
#[async_trait]
pub trait FirewallOps: Send + Sync {
    /// Called once at startup; failure downgrades the engine to run without
    /// a firewall rather than aborting it.
    async fn init(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn apply_peer_rules(&self, rules: &[FirewallRule]) -> Result<(), EngineError>;

    async fn apply_route_rules(&self, rules: &[RouteFirewallRule]) -> Result<(), EngineError>;

    /// Ingress forwarding entries, already protocol-validated by the
    /// reconciler.
    async fn apply_forwarding(&self, rules: &[ForwardEntry]) -> Result<(), EngineError>;

    /// Compatibility toggle for control planes that predate route rules.
    fn set_legacy_mode(&self, on: bool);
}

/// A validated ingress forwarding rule.
#[derive(Debug, Clone)]
pub struct ForwardEntry {
    pub protocol: meshwire_proto::map::Protocol,
    pub ingress_port: u16,
    pub translated_peer: PeerKey,
    pub translated_port: u16,
}

/// Kernel routing table manager.
#[async_trait]
pub trait RouteOps: Send + Sync {
    async fn update(
        &self,
        server_routes: &[RouteEntry],
        client_routes: &[RouteEntry],
    ) -> Result<(), EngineError>;
}

/// DNS server and forwarder manager.
#[async_trait]
pub trait DnsOps: Send + Sync {
    /// Called once at startup; failure here is fatal to engine start.
    async fn init(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn update_server(&self, cfg: &DnsConfig) -> Result<(), EngineError>;

    /// Domains the forwarder should resolve through the tunnel.
    async fn update_forwarder(&self, domains: &[String]) -> Result<(), EngineError>;
}

/// Post-quantum key-agreement daemon (Rosenpass-style).
#[async_trait]
pub trait KeyAgreementOps: Send + Sync {
    fn public_key(&self) -> String;

    fn listen_addr(&self) -> String;

    async fn on_connected(&self, peer: &PeerKey, remote_key: &str, remote_addr: &str);

    async fn on_disconnected(&self, peer: &PeerKey);
}

/// Local SSH server's authorized-key set.
#[async_trait]
pub trait SshAuthorizedKeys: Send + Sync {
    /// Replace the full authorized set.
    async fn replace(&self, keys: Vec<(PeerKey, String)>) -> Result<(), EngineError>;

    async fn remove(&self, key: &PeerKey);
}

/// The management stream. Owned by the control reader task.
#[async_trait]
pub trait ControlStream: Send {
    /// Announce ourselves; called once before the first `next_sync`.
    async fn attach(&mut self, meta: Meta) -> Result<(), StreamError>;

    /// Long-poll the next frame. A fatal error resets the engine.
    async fn next_sync(&mut self) -> Result<SyncResponse, StreamError>;
}

/// Receiving half of the signal stream. Owned by the signal router task.
#[async_trait]
pub trait SignalReceiver: Send {
    async fn next(&mut self) -> Result<SignalMessage, StreamError>;
}

/// Sending half of the signal stream, shared by all sessions.
#[async_trait]
pub trait SignalSender: Send + Sync {
    async fn send(&self, msg: SignalMessage) -> Result<(), StreamError>;
}

/// Host network change notifications; resolving means "something changed".
#[async_trait]
pub trait NetworkMonitor: Send {
    async fn next_change(&mut self) -> Result<(), StreamError>;
}

/// Local gathering constraints, identical for every attempt: the engine
/// validates them once at start and hands the dialer a shared snapshot.
#[derive(Debug, Clone, Default)]
pub struct GatheringOptions {
    /// 0 means pick a port.
    pub udp_mux_port: u16,
    pub udp_mux_srflx_port: u16,
    /// Validated `external[/internal-or-iface]` mappings; empty when the
    /// configured list failed validation and was voided.
    pub nat_external_ips: Vec<crate::config::NatMapping>,
    /// Interfaces excluded from candidate gathering.
    pub iface_black_list: Vec<String>,
    pub disable_ipv6_discovery: bool,
}

/// Which role this side plays in the ICE exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialRole {
    /// We sent the offer (greater public key).
    Initiator,
    /// We answered a remote offer.
    Responder,
}

/// ICE credentials for one side of an attempt.
#[derive(Debug, Clone)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

/// Everything a dial attempt needs, captured once so the attempt never
/// observes configuration changing under it.
pub struct DialSpec {
    pub peer: PeerKey,
    pub role: DialRole,
    pub local: IceCredentials,
    pub remote: IceCredentials,
    /// Traversal snapshot for this attempt.
    pub servers: Arc<IceServers>,
    /// Local gathering constraints.
    pub gathering: Arc<GatheringOptions>,
    /// Relay the remote says it is reachable on.
    pub relay_hint: Option<String>,
    pub remote_wg_port: Option<u16>,
}

/// Candidate plumbing between a dial attempt and its session: the dialer
/// emits local candidates on `local_tx` (the session forwards them to the
/// peer) and consumes remote ones from `remote_rx`.
pub struct DialerIo {
    pub local_tx: mpsc::Sender<String>,
    pub remote_rx: mpsc::Receiver<String>,
}

/// How the established transport reaches the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportPath {
    Direct(SocketAddr),
    Turn(SocketAddr),
    Relay(String),
}

impl std::fmt::Display for TransportPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportPath::Direct(addr) => write!(f, "direct/{addr}"),
            TransportPath::Turn(addr) => write!(f, "turn/{addr}"),
            TransportPath::Relay(addr) => write!(f, "relay/{addr}"),
        }
    }
}

/// A live peer transport. Dropping it tears the path down; `disconnected`
/// resolves when the path dies on its own.
pub struct PeerTransport {
    pub path: TransportPath,
    /// Endpoint to pin into the tunnel peer entry, when the path has one.
    pub endpoint: Option<SocketAddr>,
    pub disconnected: oneshot::Receiver<()>,
}

/// NAT-traversal dialer: wraps the ICE agent and relay client. Expected to
/// prefer a direct host/srflx pair, fall back to TURN, then to the relay
/// service from the snapshot.
#[async_trait]
pub trait TransportDialer: Send + Sync {
    async fn dial(&self, spec: DialSpec, io: DialerIo) -> Result<PeerTransport, DialError>;

    /// Opportunistic warm-up when relay infrastructure first appears in the
    /// map; failures are logged and ignored.
    async fn prepare_relay(&self, _relay: &RelayConfig) -> Result<(), DialError> {
        Ok(())
    }
}
