//! Engine supervisor.
//!
//! Owns the control mutex and the lifecycle of every subordinate piece.
//! Startup wires collaborators in a fixed order (tunnel, firewall, key
//! agreement, DNS, routes, connection manager, watchdog, signal reader,
//! control reader, network monitor); shutdown reverses it with a short drain
//! so asynchronous tunnel-peer removals settle before the device goes away.
//!
//! Fatal stream errors do not bubble up as sentinel error values: the
//! supervisor publishes a [`ShutdownReason`] on a watch channel and cancels
//! the root token, and the embedding client matches on the reason to decide
//! whether to rebuild the engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ipnet::IpNet;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use meshwire_proto::PeerKey;
use meshwire_proto::control::{ClientFlags, Meta};

use crate::admission::Admission;
use crate::collab::{
    ControlStream, DnsOps, FirewallOps, GatheringOptions, KeyAgreementOps, NetworkMonitor,
    RouteOps, SignalReceiver, SignalSender, SshAuthorizedKeys, TransportDialer, TunnelInterface,
};
use crate::config::{self, EngineConfig};
use crate::conn::{ConnectionManager, ConnectionPolicy};
use crate::error::{ConfigError, EngineError, ShutdownReason};
use crate::ice::IceHolder;
use crate::routes::ClientRoutesView;
use crate::session::{SessionCtx, SessionState};
use crate::statefile::StateFile;
use crate::status::{EngineEvent, StatusLedger};
use crate::store::PeerStore;
use crate::{health, reconcile, router};

/// Pause after dropping peer sessions so async tunnel-peer removals settle
/// before the device is destroyed.
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(500);

/// Ceiling on waiting for one session actor to acknowledge close.
pub(crate) const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Watchdog sweep period; longer than the largest negotiation timeout so a
/// healthy session always retries on its own first.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);

/// Everything the embedding client wires in at bootstrap. Implementation
/// selection happens here, once; the core never dispatches on backend kind.
pub struct Collaborators {
    pub tunnel: Arc<dyn TunnelInterface>,
    pub firewall: Option<Arc<dyn FirewallOps>>,
    pub routes: Arc<dyn RouteOps>,
    pub dns: Arc<dyn DnsOps>,
    pub ssh: Option<Arc<dyn SshAuthorizedKeys>>,
    pub pq: Option<Arc<dyn KeyAgreementOps>>,
    pub dialer: Arc<dyn TransportDialer>,
    pub control: Box<dyn ControlStream>,
    pub signal_rx: Box<dyn SignalReceiver>,
    pub signal_tx: Arc<dyn SignalSender>,
    pub monitor: Option<Box<dyn NetworkMonitor>>,
}

/// Collaborator set shared with the reconciler and sessions.
pub(crate) struct EngineOps {
    pub tunnel: Arc<dyn TunnelInterface>,
    /// `None` when disabled by config or when init failed at start: the
    /// engine then runs without a firewall rather than refusing to start.
    firewall: Option<Arc<dyn FirewallOps>>,
    pub routes: Arc<dyn RouteOps>,
    pub dns: Arc<dyn DnsOps>,
    pub ssh: Option<Arc<dyn SshAuthorizedKeys>>,
    pub pq: Option<Arc<dyn KeyAgreementOps>>,
    pub dialer: Arc<dyn TransportDialer>,
    pub signal_tx: Arc<dyn SignalSender>,
}

impl EngineOps {
    pub fn firewall(&self) -> Option<Arc<dyn FirewallOps>> {
        self.firewall.clone()
    }
}

/// Data guarded by the control mutex.
pub(crate) struct ControlState {
    pub last_applied: u64,
}

/// Healthy bits maintained by the stream reader tasks.
#[derive(Default)]
pub(crate) struct StreamHealth {
    pub control: AtomicBool,
    pub signal: AtomicBool,
}

pub(crate) struct EngineShared {
    pub cfg: EngineConfig,
    pub local_key: PeerKey,
    /// The control mutex: serializes reconciliation, signaling dispatch
    /// (candidates excepted) and lifecycle transitions.
    pub control: tokio::sync::Mutex<ControlState>,
    pub ops: EngineOps,
    pub store: Arc<PeerStore>,
    pub status: Arc<StatusLedger>,
    pub ice: Arc<IceHolder>,
    pub admission: Arc<Admission>,
    pub conn: Arc<ConnectionManager>,
    pub client_routes: Arc<ClientRoutesView>,
    pub gathering: Arc<GatheringOptions>,
    pub stream_health: StreamHealth,
    pub cancel: CancellationToken,
    pub statefile: Option<Arc<StateFile>>,
    reason_tx: watch::Sender<Option<ShutdownReason>>,
}

impl EngineShared {
    /// Callback set for a new session. Sessions get their own child token so
    /// engine shutdown reaches them without them holding an engine
    /// reference.
    pub fn session_ctx(&self) -> SessionCtx {
        SessionCtx {
            signal: Arc::clone(&self.ops.signal_tx),
            tunnel: Arc::clone(&self.ops.tunnel),
            dialer: Arc::clone(&self.ops.dialer),
            status: Arc::clone(&self.status),
            ice: Arc::clone(&self.ice),
            gathering: Arc::clone(&self.gathering),
            pq: self.ops.pq.clone(),
            admission: Arc::clone(&self.admission),
            cancel: self.cancel.child_token(),
        }
    }

    /// Record the first shutdown reason; later ones lose the race and are
    /// dropped, which keeps the report stable for the embedder.
    pub fn publish_reason(&self, reason: ShutdownReason) {
        let published = self.reason_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if published {
            self.status.emit(EngineEvent::Stopping { reason });
        }
    }
}

pub struct Engine {
    shared: Arc<EngineShared>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
    reason_rx: watch::Receiver<Option<ShutdownReason>>,
}

impl Engine {
    /// Start the engine. `local_key` is this client's public key; it drives
    /// the offer tie-break and route classification.
    pub async fn start(
        cfg: EngineConfig,
        local_key: PeerKey,
        collab: Collaborators,
    ) -> Result<Engine, EngineError> {
        let statefile = cfg
            .state_file
            .as_ref()
            .map(|path| Arc::new(StateFile::load(path.clone())));
        if let Some(state) = &statefile {
            // A missing marker means the previous run never stopped cleanly;
            // subordinate managers use their journals to restore the host.
            if state.get::<bool>("clean_shutdown") == Some(false) {
                tracing::warn!("previous engine run did not shut down cleanly");
            }
            if let Err(e) = state.put("clean_shutdown", &false) {
                tracing::warn!("failed to write state file: {e}");
            }
        }

        // Validate NAT mappings once; a malformed list is voided wholesale.
        let nat_external_ips = match config::parse_nat_external_ips(&cfg.nat_external_ips) {
            Ok(mappings) => mappings,
            Err(e) => {
                tracing::warn!("voiding NAT external IP list: {e}");
                Vec::new()
            }
        };
        let gathering = Arc::new(GatheringOptions {
            udp_mux_port: cfg.udp_mux_port,
            udp_mux_srflx_port: cfg.udp_mux_srflx_port,
            nat_external_ips,
            iface_black_list: cfg.iface_black_list.clone(),
            disable_ipv6_discovery: cfg.disable_ipv6_discovery,
        });

        // Tunnel comes up first.
        if !cfg.wg_addr.is_empty() {
            let addr: IpNet = cfg
                .wg_addr
                .parse()
                .map_err(|_| ConfigError::Address(cfg.wg_addr.clone()))?;
            collab.tunnel.set_address(addr).await?;
        }

        // Firewall is optional: an init failure downgrades, not aborts.
        let firewall = if cfg.disable_firewall {
            None
        } else {
            match &collab.firewall {
                Some(fw) => match fw.init().await {
                    Ok(()) => Some(Arc::clone(fw)),
                    Err(e) => {
                        tracing::warn!("firewall init failed, continuing without firewall: {e}");
                        None
                    }
                },
                None => None,
            }
        };

        // DNS init failure is fatal to start.
        if !cfg.disable_dns {
            collab
                .dns
                .init()
                .await
                .map_err(|e| EngineError::DnsInit(e.to_string()))?;
        }

        let store = Arc::new(PeerStore::new());
        let policy = if cfg.lazy_connection_enabled {
            ConnectionPolicy::Lazy
        } else {
            ConnectionPolicy::Eager
        };
        let conn = Arc::new(ConnectionManager::new(Arc::clone(&store), policy));
        let (reason_tx, reason_rx) = watch::channel(None);

        let pq = if cfg.rosenpass_enabled {
            collab.pq.clone()
        } else {
            None
        };

        let shared = Arc::new(EngineShared {
            local_key,
            control: tokio::sync::Mutex::new(ControlState { last_applied: 0 }),
            ops: EngineOps {
                tunnel: collab.tunnel,
                firewall,
                routes: collab.routes,
                dns: collab.dns,
                ssh: collab.ssh,
                pq,
                dialer: collab.dialer,
                signal_tx: collab.signal_tx,
            },
            store,
            status: Arc::new(StatusLedger::new()),
            ice: Arc::new(IceHolder::new()),
            admission: Arc::new(Admission::new(cfg.admission_limit)),
            conn,
            client_routes: Arc::new(ClientRoutesView::new()),
            gathering,
            stream_health: StreamHealth::default(),
            cancel: CancellationToken::new(),
            statefile,
            reason_tx,
            cfg,
        });

        let mut tasks = Vec::new();

        // Negotiation watchdog: reopens sessions stuck in Failed past their
        // backoff window.
        tasks.push(tokio::spawn(watchdog(Arc::clone(&shared))));

        tasks.push(tokio::spawn(router::run(collab.signal_rx, Arc::clone(&shared))));

        tasks.push(tokio::spawn(control_reader(
            collab.control,
            Arc::clone(&shared),
        )));

        if shared.cfg.network_monitor {
            if let Some(monitor) = collab.monitor {
                tasks.push(tokio::spawn(network_monitor(monitor, Arc::clone(&shared))));
            }
        }

        tracing::info!(key = %local_key.short(), "engine started");
        Ok(Engine {
            shared,
            tasks: parking_lot::Mutex::new(tasks),
            stopped: AtomicBool::new(false),
            reason_rx,
        })
    }

    /// Stop the engine. Idempotent; a second call returns immediately.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.publish_reason(ShutdownReason::GracefulStop);

        // Drop every peer session under the control mutex so reconciliation
        // and dispatch cannot interleave with teardown.
        {
            let _guard = self.shared.control.lock().await;
            for key in self.shared.store.keys() {
                if let Some(session) = self.shared.store.remove(&key) {
                    if tokio::time::timeout(SESSION_CLOSE_TIMEOUT, session.close(true))
                        .await
                        .is_err()
                    {
                        tracing::warn!(peer = %key.short(), "session did not close in time, abandoning");
                    }
                }
                if let Err(e) = self.shared.ops.tunnel.remove_peer(&key).await {
                    tracing::warn!(peer = %key.short(), "tunnel peer removal failed: {e}");
                }
                self.shared.status.remove_peer(&key);
            }
        }

        // Let asynchronous tunnel-peer removals settle before the device is
        // destroyed by the embedder.
        tokio::time::sleep(SHUTDOWN_DRAIN).await;

        self.shared.cancel.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.status.clear();
        if let Some(state) = &self.shared.statefile {
            if let Err(e) = state.put("clean_shutdown", &true) {
                tracing::warn!("failed to write state file: {e}");
            }
        }
        tracing::info!("engine stopped");
    }

    /// Ask the embedder to rebuild the engine: publishes the reason and
    /// cancels the root context. The embedder observes
    /// [`Engine::shutdown_reason`], calls [`Engine::stop`], and reconstructs.
    pub fn request_reset(&self, reason: ShutdownReason) {
        self.shared.publish_reason(reason);
        self.shared.cancel.cancel();
    }

    /// Resolve once a shutdown reason is published.
    pub async fn shutdown_reason(&self) -> ShutdownReason {
        let mut rx = self.reason_rx.clone();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return ShutdownReason::GracefulStop;
            }
        }
    }

    pub fn status(&self) -> Arc<StatusLedger> {
        Arc::clone(&self.shared.status)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.shared.status.subscribe()
    }

    /// Local traffic observation hook for lazy mode (wired to the data plane
    /// by the embedder).
    pub async fn notice_traffic(&self, dst: std::net::IpAddr) {
        self.shared.conn.notice_traffic(dst).await;
    }

    /// On-demand health probe; see [`health::HealthReport`].
    pub async fn probe_health(&self) -> health::HealthReport {
        health::probe(&self.shared).await
    }

    /// The persisted state document shared with subordinate managers, when
    /// persistence is configured.
    pub fn statefile(&self) -> Option<Arc<StateFile>> {
        self.shared.statefile.clone()
    }
}

async fn watchdog(shared: Arc<EngineShared>) {
    let mut interval = tokio::time::interval(WATCHDOG_INTERVAL);
    interval.tick().await; // skip the immediate tick
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        for session in shared.store.sessions() {
            if session.state() == SessionState::Failed {
                tracing::debug!(peer = %session.key().short(), "watchdog reopening failed session");
                session.open().await;
            }
        }
    }
}

async fn control_reader(mut control: Box<dyn ControlStream>, shared: Arc<EngineShared>) {
    let meta = Meta {
        hostname: std::env::var("HOSTNAME").unwrap_or_default(),
        os: std::env::consts::OS.to_string(),
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
        flags: ClientFlags {
            lazy_connection: shared.cfg.lazy_connection_enabled,
            server_ssh_allowed: shared.cfg.server_ssh_allowed,
            rosenpass: shared.cfg.rosenpass_enabled,
        },
    };
    if let Err(e) = control.attach(meta).await {
        tracing::error!("control attach failed: {e}");
        shared.stream_health.control.store(false, Ordering::Relaxed);
        shared.publish_reason(ShutdownReason::ResetByControl);
        shared.cancel.cancel();
        return;
    }
    shared.stream_health.control.store(true, Ordering::Relaxed);

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            sync = control.next_sync() => match sync {
                Ok(sync) => {
                    shared.stream_health.control.store(true, Ordering::Relaxed);
                    let mut state = shared.control.lock().await;
                    if let Err(e) = reconcile::apply_sync(&shared, &mut state, sync).await {
                        tracing::error!("reconciliation failed: {e}");
                    }
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!("control stream failed: {e}");
                    shared.stream_health.control.store(false, Ordering::Relaxed);
                    shared.publish_reason(ShutdownReason::ResetByControl);
                    shared.cancel.cancel();
                    return;
                }
                Err(e) => {
                    shared.stream_health.control.store(false, Ordering::Relaxed);
                    tracing::warn!("control stream transient error: {e}");
                }
            }
        }
    }
}

async fn network_monitor(mut monitor: Box<dyn NetworkMonitor>, shared: Arc<EngineShared>) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            change = monitor.next_change() => match change {
                Ok(()) => {
                    tracing::info!("host network changed, requesting engine reset");
                    shared.publish_reason(ShutdownReason::ResetByNetworkChange);
                    shared.cancel.cancel();
                    return;
                }
                Err(e) => {
                    tracing::warn!("network monitor stopped: {e}");
                    return;
                }
            }
        }
    }
}
