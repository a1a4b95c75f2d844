//! Mock collaborators for engine scenarios.
//!
//! Everything records what the engine did to it; inbound streams are fed
//! from the test through channels.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use meshwire_engine::collab::{
    ControlStream, DialSpec, DialerIo, DnsOps, FirewallOps, ForwardEntry, PeerTransport, RouteOps,
    SignalReceiver, SignalSender, SshAuthorizedKeys, TransferStats, TransportDialer,
    TransportPath, TunnelInterface, TunnelPeer,
};
use meshwire_engine::engine::Collaborators;
use meshwire_engine::error::{DialError, EngineError, StreamError};
use meshwire_engine::routes::RouteEntry;
use meshwire_engine::{Engine, EngineConfig};
use meshwire_proto::PeerKey;
use meshwire_proto::control::{Meta, SyncResponse};
use meshwire_proto::map::{DnsConfig, FirewallRule, NetworkMap, PeerDescriptor, RouteFirewallRule};
use meshwire_proto::signal::{SessionPayload, SignalBody, SignalMessage};

pub fn key(n: u8) -> PeerKey {
    PeerKey::from_bytes([n; 32])
}

/// Engine logs in test output with `RUST_LOG=meshwire_engine=debug`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `cond` until it holds or a deadline passes.
pub async fn wait_for(cond: impl Fn() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Short settle for negative assertions ("nothing happened").
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

// ── Tunnel ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockTunnel {
    pub address: Mutex<Option<IpNet>>,
    pub peers: Mutex<HashMap<PeerKey, TunnelPeer>>,
}

#[async_trait]
impl TunnelInterface for MockTunnel {
    fn address(&self) -> Result<IpNet, EngineError> {
        self.address
            .lock()
            .ok_or(EngineError::TunnelNotInitialized)
    }

    async fn set_address(&self, addr: IpNet) -> Result<(), EngineError> {
        *self.address.lock() = Some(addr);
        Ok(())
    }

    async fn upsert_peer(&self, peer: TunnelPeer) -> Result<(), EngineError> {
        self.peers.lock().insert(peer.key, peer);
        Ok(())
    }

    async fn remove_peer(&self, key: &PeerKey) -> Result<(), EngineError> {
        self.peers.lock().remove(key);
        Ok(())
    }

    async fn peer_stats(&self, key: &PeerKey) -> Option<TransferStats> {
        self.peers.lock().get(key).map(|_| TransferStats::default())
    }
}

impl MockTunnel {
    pub fn allowed_ips(&self, key: &PeerKey) -> Option<Vec<IpNet>> {
        self.peers.lock().get(key).map(|p| {
            let mut ips = p.allowed_ips.clone();
            ips.sort();
            ips
        })
    }
}

// ── Managers ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockFirewall {
    pub peer_rules: Mutex<Vec<FirewallRule>>,
    pub route_rules: Mutex<Vec<RouteFirewallRule>>,
    pub forwarding: Mutex<Vec<ForwardEntry>>,
    pub legacy_mode: Mutex<bool>,
    pub applies: Mutex<u32>,
}

#[async_trait]
impl FirewallOps for MockFirewall {
    async fn apply_peer_rules(&self, rules: &[FirewallRule]) -> Result<(), EngineError> {
        *self.peer_rules.lock() = rules.to_vec();
        *self.applies.lock() += 1;
        Ok(())
    }

    async fn apply_route_rules(&self, rules: &[RouteFirewallRule]) -> Result<(), EngineError> {
        *self.route_rules.lock() = rules.to_vec();
        Ok(())
    }

    async fn apply_forwarding(&self, rules: &[ForwardEntry]) -> Result<(), EngineError> {
        *self.forwarding.lock() = rules.to_vec();
        Ok(())
    }

    fn set_legacy_mode(&self, on: bool) {
        *self.legacy_mode.lock() = on;
    }
}

#[derive(Default)]
pub struct MockRoutes {
    pub server: Mutex<Vec<RouteEntry>>,
    pub client: Mutex<Vec<RouteEntry>>,
    pub updates: Mutex<u32>,
}

#[async_trait]
impl RouteOps for MockRoutes {
    async fn update(
        &self,
        server_routes: &[RouteEntry],
        client_routes: &[RouteEntry],
    ) -> Result<(), EngineError> {
        *self.server.lock() = server_routes.to_vec();
        *self.client.lock() = client_routes.to_vec();
        *self.updates.lock() += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct MockDns {
    pub configs: Mutex<Vec<DnsConfig>>,
    pub forward_domains: Mutex<Vec<String>>,
}

#[async_trait]
impl DnsOps for MockDns {
    async fn update_server(&self, cfg: &DnsConfig) -> Result<(), EngineError> {
        self.configs.lock().push(cfg.clone());
        Ok(())
    }

    async fn update_forwarder(&self, domains: &[String]) -> Result<(), EngineError> {
        *self.forward_domains.lock() = domains.to_vec();
        Ok(())
    }
}

#[derive(Default)]
pub struct MockSsh {
    pub keys: Mutex<Vec<(PeerKey, String)>>,
}

#[async_trait]
impl SshAuthorizedKeys for MockSsh {
    async fn replace(&self, keys: Vec<(PeerKey, String)>) -> Result<(), EngineError> {
        *self.keys.lock() = keys;
        Ok(())
    }

    async fn remove(&self, key: &PeerKey) {
        self.keys.lock().retain(|(k, _)| k != key);
    }
}

// ── Streams ──────────────────────────────────────────────────────

pub struct MockControl {
    rx: mpsc::Receiver<SyncResponse>,
}

#[async_trait]
impl ControlStream for MockControl {
    async fn attach(&mut self, _meta: Meta) -> Result<(), StreamError> {
        Ok(())
    }

    async fn next_sync(&mut self) -> Result<SyncResponse, StreamError> {
        self.rx.recv().await.ok_or(StreamError::Closed)
    }
}

pub struct MockSignalRx {
    rx: mpsc::Receiver<SignalMessage>,
}

#[async_trait]
impl SignalReceiver for MockSignalRx {
    async fn next(&mut self) -> Result<SignalMessage, StreamError> {
        self.rx.recv().await.ok_or(StreamError::Closed)
    }
}

#[derive(Default)]
pub struct MockSignalTx {
    pub sent: Mutex<Vec<SignalMessage>>,
}

#[async_trait]
impl SignalSender for MockSignalTx {
    async fn send(&self, msg: SignalMessage) -> Result<(), StreamError> {
        self.sent.lock().push(msg);
        Ok(())
    }
}

impl MockSignalTx {
    pub fn count(&self, to: &PeerKey, kind: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.to == *to && m.body.kind() == kind)
            .count()
    }

    pub fn total(&self, kind: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.body.kind() == kind)
            .count()
    }

    pub fn last_payload_to(&self, to: &PeerKey) -> Option<SessionPayload> {
        self.sent
            .lock()
            .iter()
            .rev()
            .find_map(|m| match (&m.body, m.to == *to) {
                (SignalBody::Offer(p), true) | (SignalBody::Answer(p), true) => Some(p.clone()),
                _ => None,
            })
    }
}

// ── Dialer ───────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum DialMode {
    /// Resolve immediately with a direct path.
    Succeed,
    /// Never resolve; the session sits in Connecting until timeout/abort.
    Pend,
    /// Fail immediately as unreachable.
    Fail,
}

pub struct MockDialer {
    pub mode: Mutex<DialMode>,
    pub dials: Mutex<Vec<PeerKey>>,
    /// Per-peer handles to simulate a transport drop.
    pub disconnectors: Mutex<HashMap<PeerKey, oneshot::Sender<()>>>,
}

impl Default for MockDialer {
    fn default() -> Self {
        Self {
            mode: Mutex::new(DialMode::Succeed),
            dials: Mutex::new(Vec::new()),
            disconnectors: Mutex::new(HashMap::new()),
        }
    }
}

impl MockDialer {
    pub fn set_mode(&self, mode: DialMode) {
        *self.mode.lock() = mode;
    }

    /// Kill the live transport of `peer`, as a path failure would.
    pub fn drop_transport(&self, peer: &PeerKey) {
        if let Some(tx) = self.disconnectors.lock().remove(peer) {
            let _ = tx.send(());
        }
    }
}

#[async_trait]
impl TransportDialer for MockDialer {
    async fn dial(&self, spec: DialSpec, _io: DialerIo) -> Result<PeerTransport, DialError> {
        self.dials.lock().push(spec.peer);
        let mode = *self.mode.lock();
        match mode {
            DialMode::Succeed => {
                let (tx, rx) = oneshot::channel();
                self.disconnectors.lock().insert(spec.peer, tx);
                let endpoint: SocketAddr = "192.0.2.10:51820".parse().expect("literal addr");
                Ok(PeerTransport {
                    path: TransportPath::Direct(endpoint),
                    endpoint: Some(endpoint),
                    disconnected: rx,
                })
            }
            DialMode::Pend => std::future::pending().await,
            DialMode::Fail => Err(DialError::Unreachable("mock".into())),
        }
    }
}

// ── Harness ──────────────────────────────────────────────────────

pub struct Harness {
    pub engine: Engine,
    pub local_key: PeerKey,
    pub tunnel: Arc<MockTunnel>,
    pub firewall: Arc<MockFirewall>,
    pub routes: Arc<MockRoutes>,
    pub dns: Arc<MockDns>,
    pub ssh: Arc<MockSsh>,
    pub dialer: Arc<MockDialer>,
    pub signal_tx: Arc<MockSignalTx>,
    pub control_in: mpsc::Sender<SyncResponse>,
    pub signal_in: mpsc::Sender<SignalMessage>,
}

impl Harness {
    pub async fn start(cfg: EngineConfig) -> Self {
        init_tracing();
        let local_key = key(100);
        let tunnel = Arc::new(MockTunnel::default());
        let firewall = Arc::new(MockFirewall::default());
        let routes = Arc::new(MockRoutes::default());
        let dns = Arc::new(MockDns::default());
        let ssh = Arc::new(MockSsh::default());
        let dialer = Arc::new(MockDialer::default());
        let signal_tx = Arc::new(MockSignalTx::default());
        let (control_in, control_rx) = mpsc::channel(16);
        let (signal_in, signal_rx) = mpsc::channel(64);

        let collab = Collaborators {
            tunnel: Arc::clone(&tunnel) as _,
            firewall: Some(Arc::clone(&firewall) as _),
            routes: Arc::clone(&routes) as _,
            dns: Arc::clone(&dns) as _,
            ssh: Some(Arc::clone(&ssh) as _),
            pq: None,
            dialer: Arc::clone(&dialer) as _,
            control: Box::new(MockControl { rx: control_rx }),
            signal_rx: Box::new(MockSignalRx { rx: signal_rx }),
            signal_tx: Arc::clone(&signal_tx) as _,
            monitor: None,
        };
        let engine = Engine::start(cfg, local_key, collab)
            .await
            .expect("engine start");

        Self {
            engine,
            local_key,
            tunnel,
            firewall,
            routes,
            dns,
            ssh,
            dialer,
            signal_tx,
            control_in,
            signal_in,
        }
    }

    pub async fn push_map(&self, map: NetworkMap) {
        self.control_in
            .send(SyncResponse {
                network_map: Some(map),
                ..Default::default()
            })
            .await
            .expect("control stream open");
    }

    pub async fn push_signal(&self, from: PeerKey, body: SignalBody) {
        self.signal_in
            .send(SignalMessage {
                from,
                to: self.local_key,
                body,
            })
            .await
            .expect("signal stream open");
    }

    pub fn peer_status(&self, key: &PeerKey) -> Option<meshwire_engine::ConnStatus> {
        self.engine.status().get(key).map(|p| p.status)
    }
}

/// Map builder with sensible defaults.
pub fn map(serial: u64, peers: Vec<PeerDescriptor>) -> NetworkMap {
    let mut map: NetworkMap =
        serde_json::from_str(r#"{"serial": 0, "local": {"address": "100.64.0.1/16"}}"#)
            .expect("template map");
    map.serial = serial;
    map.remote_peers_is_empty = peers.is_empty();
    map.peers = peers;
    map
}

pub fn peer(n: u8, allowed: &[&str]) -> PeerDescriptor {
    PeerDescriptor {
        key: key(n),
        allowed_ips: allowed.iter().map(|s| s.to_string()).collect(),
        fqdn: format!("peer-{n}.mesh.example"),
        agent_version: "0.30.0".into(),
        ssh_public_key: None,
        pq_public_key: None,
    }
}

pub fn offer_payload() -> SessionPayload {
    SessionPayload {
        ufrag: "remoteUf".into(),
        pwd: "remotePassword0123456".into(),
        credential_sig: String::new(),
        wg_port: Some(51820),
        pq_key: None,
        pq_addr: None,
        relay_addr: None,
    }
}
