//! Per-peer negotiation sessions.
//!
//! One actor task per remote peer. The mailbox carries lifecycle commands
//! from the connection manager and signaling from the router; helper tasks
//! (admission wait, dial attempt, timers, transport watch) report back on an
//! internal channel so the actor never blocks on anything but its own
//! channels.
//!
//! # State machine
//!
//! ```text
//! Idle ──open/activate──▶ Dialing ──offer sent──▶ Offered ──answer──▶ Connecting
//!                         Dialing ──remote offer──▶ Answered ──────▶ Connecting
//! Connecting ──dial ok──▶ Connected ──path down──▶ Reconnecting ──▶ Dialing
//! Connecting ──timeout──▶ Failed ──backoff──▶ Dialing
//! any ──close──▶ Closed
//! ```
//!
//! When both sides offer at once, the peer with the greater public key stays
//! initiator and the other converts to responder, without an extra
//! round-trip.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use meshwire_proto::PeerKey;
use meshwire_proto::signal::{self, SessionPayload, SignalBody, SignalMessage};

use crate::admission::Admission;
use crate::collab::{
    DialRole, DialSpec, DialerIo, GatheringOptions, IceCredentials, KeyAgreementOps,
    PeerTransport, SignalSender, TransportDialer, TunnelInterface, TunnelPeer,
};
use crate::error::DialError;
use crate::ice::IceHolder;
use crate::status::{ConnStatus, StatusLedger};

/// Negotiation timeout bounds: uniform random per attempt so a fleet of
/// peers losing a server does not retry in lockstep.
const TIMEOUT_MIN_MS: u64 = 30_000;
const TIMEOUT_MAX_MS: u64 = 45_000;

/// First retry delay after a failed attempt; doubles up to the attempt's
/// randomized timeout.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Remote candidates buffered while no dial attempt is running.
const MAX_PENDING_CANDIDATES: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Dialing,
    Offered,
    Answered,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

/// Immutable per-incarnation configuration.
#[derive(Clone)]
pub struct SessionConfig {
    pub key: PeerKey,
    pub local_key: PeerKey,
    pub fqdn: String,
    pub agent_version: String,
    pub allowed_ips: Arc<Vec<IpNet>>,
    pub ssh_public_key: Option<String>,
    /// Remote post-quantum key from the map, if any.
    pub pq_public_key: Option<String>,
    pub wg_port: u16,
    pub preshared_key: Option<String>,
    pub keepalive: Duration,
}

/// Callback set handed to the session at construction. Sessions never hold a
/// reference back to the engine.
pub struct SessionCtx {
    pub signal: Arc<dyn SignalSender>,
    pub tunnel: Arc<dyn TunnelInterface>,
    pub dialer: Arc<dyn TransportDialer>,
    pub status: Arc<StatusLedger>,
    pub ice: Arc<IceHolder>,
    pub gathering: Arc<GatheringOptions>,
    pub pq: Option<Arc<dyn KeyAgreementOps>>,
    pub admission: Arc<Admission>,
    pub cancel: CancellationToken,
}

enum SessionCmd {
    Open,
    Activate,
    Deactivate,
    RemoteOffer(SessionPayload),
    RemoteAnswer(SessionPayload),
    RemoteCandidate {
        candidate: String,
        client_routes: Arc<Vec<IpNet>>,
    },
    Close {
        graceful: bool,
        done: oneshot::Sender<()>,
    },
}

/// Events from helper tasks back into the actor. Each carries the attempt
/// epoch it belongs to so stale timers and dial results are ignored.
enum Internal {
    Admitted(OwnedSemaphorePermit),
    DialDone(u64, Result<PeerTransport, DialError>),
    NegotiationTimeout(u64),
    RetryNow,
    TransportDown(u64),
}

struct SessionShared {
    cfg: SessionConfig,
    state: Mutex<SessionState>,
}

/// Cheap cloneable handle to a running session actor.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCmd>,
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn key(&self) -> PeerKey {
        self.shared.cfg.key
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    pub fn allowed_ips(&self) -> Arc<Vec<IpNet>> {
        Arc::clone(&self.shared.cfg.allowed_ips)
    }

    pub fn fqdn(&self) -> &str {
        &self.shared.cfg.fqdn
    }

    pub fn agent_version(&self) -> &str {
        &self.shared.cfg.agent_version
    }

    pub fn ssh_public_key(&self) -> Option<&str> {
        self.shared.cfg.ssh_public_key.as_deref()
    }

    /// Begin negotiation (eager path). The session stays `Idle` while it
    /// waits for an admission slot.
    pub async fn open(&self) {
        let _ = self.cmd_tx.send(SessionCmd::Open).await;
    }

    /// Wake a lazy session. The state leaves `Idle` before this returns, so
    /// a caller dispatching the triggering signal right after observes an
    /// active session.
    pub async fn activate(&self) {
        {
            let mut state = self.shared.state.lock();
            if *state == SessionState::Idle {
                *state = SessionState::Dialing;
            }
        }
        let _ = self.cmd_tx.send(SessionCmd::Activate).await;
    }

    pub async fn deactivate(&self) {
        let _ = self.cmd_tx.send(SessionCmd::Deactivate).await;
    }

    pub async fn remote_offer(&self, payload: SessionPayload) {
        let _ = self.cmd_tx.send(SessionCmd::RemoteOffer(payload)).await;
    }

    pub async fn remote_answer(&self, payload: SessionPayload) {
        let _ = self.cmd_tx.send(SessionCmd::RemoteAnswer(payload)).await;
    }

    /// Candidates commute, so this deliberately does not wait for mailbox
    /// space: a full mailbox drops the candidate rather than stalling the
    /// router.
    pub fn remote_candidate(&self, candidate: String, client_routes: Arc<Vec<IpNet>>) {
        if self
            .cmd_tx
            .try_send(SessionCmd::RemoteCandidate {
                candidate,
                client_routes,
            })
            .is_err()
        {
            tracing::warn!(peer = %self.shared.cfg.key.short(), "session mailbox full, dropping candidate");
        }
    }

    /// Tear the session down. Resolves once the actor has cleaned up, or
    /// immediately if it is already gone.
    pub async fn close(&self, graceful: bool) {
        let (done, done_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SessionCmd::Close { graceful, done })
            .await
            .is_err()
        {
            return;
        }
        let _ = done_rx.await;
    }
}

/// Spawn a session actor for one remote peer.
pub fn spawn(cfg: SessionConfig, ctx: SessionCtx) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (internal_tx, internal_rx) = mpsc::channel(64);
    let shared = Arc::new(SessionShared {
        cfg: cfg.clone(),
        state: Mutex::new(SessionState::Idle),
    });

    let actor = Session {
        cfg,
        ctx,
        shared: Arc::clone(&shared),
        internal_tx,
        epoch: 0,
        attempts: 0,
        ever_connected: false,
        admission_pending: false,
        permit: None,
        local_creds: None,
        remote_payload: None,
        wants_respond: false,
        pending_candidates: Vec::new(),
        remote_cand_tx: None,
        dial_task: None,
        candidate_fwd: None,
        watch_task: None,
        timeout: Duration::from_millis(TIMEOUT_MIN_MS),
        backoff: INITIAL_BACKOFF,
    };
    tokio::spawn(actor.run(cmd_rx, internal_rx));

    SessionHandle { cmd_tx, shared }
}

struct Session {
    cfg: SessionConfig,
    ctx: SessionCtx,
    shared: Arc<SessionShared>,
    internal_tx: mpsc::Sender<Internal>,

    /// Attempt epoch; bumped whenever an attempt is aborted so stale helper
    /// results are ignored.
    epoch: u64,
    attempts: u32,
    ever_connected: bool,
    admission_pending: bool,
    permit: Option<OwnedSemaphorePermit>,
    local_creds: Option<IceCredentials>,
    remote_payload: Option<SessionPayload>,
    /// A remote offer arrived while we were still waiting for admission;
    /// answer it as soon as the slot lands.
    wants_respond: bool,
    pending_candidates: Vec<String>,
    remote_cand_tx: Option<mpsc::Sender<String>>,
    dial_task: Option<JoinHandle<()>>,
    candidate_fwd: Option<JoinHandle<()>>,
    watch_task: Option<JoinHandle<()>>,
    /// Randomized negotiation deadline for the current attempt.
    timeout: Duration,
    backoff: Duration,
}

impl Session {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SessionCmd>,
        mut internal_rx: mpsc::Receiver<Internal>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => {
                    // Engine shutdown: abandon without wire teardown; the
                    // supervisor's drain window covers the rest.
                    self.abort_helpers();
                    self.set_state(SessionState::Closed);
                    return;
                }
                cmd = cmd_rx.recv() => match cmd {
                    None => {
                        self.abort_helpers();
                        self.set_state(SessionState::Closed);
                        return;
                    }
                    Some(SessionCmd::Close { graceful, done }) => {
                        self.close(graceful).await;
                        let _ = done.send(());
                        return;
                    }
                    Some(cmd) => self.on_cmd(cmd).await,
                },
                Some(event) = internal_rx.recv() => self.on_internal(event).await,
            }
        }
    }

    fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    fn set_state(&self, next: SessionState) {
        let prev = {
            let mut state = self.shared.state.lock();
            std::mem::replace(&mut *state, next)
        };
        if prev != next {
            tracing::debug!(
                peer = %self.cfg.key.short(),
                from = ?prev,
                to = ?next,
                "session state"
            );
        }
        let status = match next {
            SessionState::Idle => Some(ConnStatus::Idle),
            SessionState::Dialing
            | SessionState::Offered
            | SessionState::Answered
            | SessionState::Connecting
            | SessionState::Reconnecting
            | SessionState::Failed => Some(ConnStatus::Connecting),
            // Connected is reported with its path by the caller.
            SessionState::Connected | SessionState::Closed => None,
        };
        if let Some(status) = status {
            self.ctx.status.set_status(&self.cfg.key, status, None);
        }
    }

    async fn on_cmd(&mut self, cmd: SessionCmd) {
        match cmd {
            SessionCmd::Open | SessionCmd::Activate => self.begin_open().await,
            SessionCmd::Deactivate => self.quiesce().await,
            SessionCmd::RemoteOffer(payload) => self.on_remote_offer(payload).await,
            SessionCmd::RemoteAnswer(payload) => self.on_remote_answer(payload).await,
            SessionCmd::RemoteCandidate {
                candidate,
                client_routes,
            } => self.on_remote_candidate(candidate, &client_routes),
            SessionCmd::Close { .. } => unreachable!("handled in run()"),
        }
    }

    async fn on_internal(&mut self, event: Internal) {
        match event {
            Internal::Admitted(permit) => {
                self.admission_pending = false;
                if self.state() == SessionState::Closed {
                    return;
                }
                self.permit = Some(permit);
                if self.wants_respond && self.remote_payload.is_some() {
                    self.respond_as_responder().await;
                } else {
                    self.start_attempt().await;
                }
            }
            Internal::DialDone(epoch, result) if epoch == self.epoch => match result {
                Ok(transport) => self.on_dial_success(transport).await,
                Err(err) => {
                    if matches!(err, DialError::RelayAuth(_)) {
                        // Non-fatal: a later map may refresh the token.
                        tracing::warn!(peer = %self.cfg.key.short(), "relay rejected credentials: {err}");
                    }
                    self.fail_attempt(&err.to_string()).await;
                }
            },
            Internal::NegotiationTimeout(epoch) if epoch == self.epoch => {
                if matches!(
                    self.state(),
                    SessionState::Dialing
                        | SessionState::Offered
                        | SessionState::Answered
                        | SessionState::Connecting
                ) {
                    self.fail_attempt("negotiation timed out").await;
                }
            }
            Internal::RetryNow => {
                if self.state() == SessionState::Failed {
                    self.begin_open().await;
                }
            }
            Internal::TransportDown(epoch) if epoch == self.epoch => {
                if self.state() == SessionState::Connected {
                    tracing::info!(peer = %self.cfg.key.short(), "peer transport lost, reconnecting");
                    if let Some(pq) = &self.ctx.pq {
                        pq.on_disconnected(&self.cfg.key).await;
                    }
                    self.abort_attempt();
                    self.set_state(SessionState::Reconnecting);
                    self.begin_open().await;
                }
            }
            // Stale epochs fall through here.
            Internal::DialDone(..) | Internal::NegotiationTimeout(_) | Internal::TransportDown(_) => {}
        }
    }

    /// Entry point for Open/Activate/retry/reconnect.
    async fn begin_open(&mut self) {
        match self.state() {
            SessionState::Closed
            | SessionState::Offered
            | SessionState::Answered
            | SessionState::Connecting
            | SessionState::Connected => return,
            _ => {}
        }
        if self.ever_connected || self.permit.is_some() {
            self.start_attempt().await;
            return;
        }
        if self.admission_pending {
            return;
        }
        // First handshake: wait for an admission slot off-loop so signaling
        // keeps flowing while we queue.
        self.admission_pending = true;
        let admission = Arc::clone(&self.ctx.admission);
        let cancel = self.ctx.cancel.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            if let Some(permit) = admission.acquire(&cancel).await {
                let _ = tx.send(Internal::Admitted(permit)).await;
            }
        });
    }

    /// Start (or restart) a negotiation attempt as the offering side.
    async fn start_attempt(&mut self) {
        self.abort_attempt();
        self.attempts += 1;
        self.ctx.status.record_attempt(&self.cfg.key);
        self.timeout =
            Duration::from_millis(rand::thread_rng().gen_range(TIMEOUT_MIN_MS..TIMEOUT_MAX_MS));
        self.local_creds = Some(generate_credentials());
        self.set_state(SessionState::Dialing);
        self.arm_timeout();

        if self.wants_respond && self.remote_payload.is_some() {
            self.respond_as_responder().await;
            return;
        }

        let payload = self.local_payload();
        let msg = SignalMessage {
            from: self.cfg.local_key,
            to: self.cfg.key,
            body: SignalBody::Offer(payload),
        };
        match self.ctx.signal.send(msg).await {
            Ok(()) => self.set_state(SessionState::Offered),
            Err(e) => {
                tracing::warn!(peer = %self.cfg.key.short(), "failed to send offer: {e}");
                self.fail_attempt("offer send failed").await;
            }
        }
    }

    /// Answer a stored remote offer and start dialing as the responder.
    async fn respond_as_responder(&mut self) {
        self.wants_respond = false;
        if self.local_creds.is_none() {
            self.attempts += 1;
            self.ctx.status.record_attempt(&self.cfg.key);
            self.timeout = Duration::from_millis(
                rand::thread_rng().gen_range(TIMEOUT_MIN_MS..TIMEOUT_MAX_MS),
            );
            self.local_creds = Some(generate_credentials());
            self.arm_timeout();
        }
        self.set_state(SessionState::Answered);

        let payload = self.local_payload();
        let msg = SignalMessage {
            from: self.cfg.local_key,
            to: self.cfg.key,
            body: SignalBody::Answer(payload),
        };
        if let Err(e) = self.ctx.signal.send(msg).await {
            tracing::warn!(peer = %self.cfg.key.short(), "failed to send answer: {e}");
            self.fail_attempt("answer send failed").await;
            return;
        }
        self.set_state(SessionState::Connecting);
        self.start_dial(DialRole::Responder);
    }

    async fn on_remote_offer(&mut self, payload: SessionPayload) {
        if !self.verify_credentials(&payload) {
            tracing::warn!(peer = %self.cfg.key.short(), "dropping offer with bad credential signature");
            return;
        }
        self.remote_payload = Some(payload);

        match self.state() {
            SessionState::Offered => {
                // Simultaneous offers: the greater key stays initiator.
                if self.cfg.local_key > self.cfg.key {
                    tracing::debug!(
                        peer = %self.cfg.key.short(),
                        "simultaneous offers, keeping initiator role"
                    );
                    return;
                }
                self.respond_as_responder().await;
            }
            SessionState::Idle | SessionState::Dialing | SessionState::Failed => {
                if self.ever_connected || self.permit.is_some() {
                    self.respond_as_responder().await;
                } else {
                    self.wants_respond = true;
                    self.begin_open().await;
                }
            }
            SessionState::Answered | SessionState::Connecting => {
                // Peer restarted mid-negotiation; start over as responder.
                self.abort_attempt();
                self.respond_as_responder().await;
            }
            SessionState::Connected | SessionState::Reconnecting => {
                // Peer restarted behind our back; renegotiate.
                if let Some(pq) = &self.ctx.pq {
                    pq.on_disconnected(&self.cfg.key).await;
                }
                self.abort_attempt();
                self.respond_as_responder().await;
            }
            SessionState::Closed => {}
        }
    }

    async fn on_remote_answer(&mut self, payload: SessionPayload) {
        if self.state() != SessionState::Offered {
            tracing::debug!(
                peer = %self.cfg.key.short(),
                state = ?self.state(),
                "ignoring answer outside Offered"
            );
            return;
        }
        if !self.verify_credentials(&payload) {
            tracing::warn!(peer = %self.cfg.key.short(), "dropping answer with bad credential signature");
            return;
        }
        self.remote_payload = Some(payload);
        self.set_state(SessionState::Connecting);
        self.start_dial(DialRole::Initiator);
    }

    fn on_remote_candidate(&mut self, candidate: String, client_routes: &[IpNet]) {
        if let Some(ip) = candidate_ip(&candidate) {
            if crate::routes::ip_in_routes(ip, client_routes) {
                // Inside a VPN-routed prefix: using it would loop traffic
                // back into the tunnel.
                tracing::debug!(
                    peer = %self.cfg.key.short(),
                    %ip,
                    "discarding candidate inside a client route"
                );
                return;
            }
        }
        match &self.remote_cand_tx {
            Some(tx) => {
                let _ = tx.try_send(candidate);
            }
            None => {
                if self.pending_candidates.len() < MAX_PENDING_CANDIDATES {
                    self.pending_candidates.push(candidate);
                }
            }
        }
    }

    fn start_dial(&mut self, role: DialRole) {
        let Some(remote) = self.remote_payload.clone() else {
            return;
        };
        let Some(local) = self.local_creds.clone() else {
            return;
        };

        let (local_tx, mut local_rx) = mpsc::channel::<String>(64);
        let (remote_tx, remote_rx) = mpsc::channel::<String>(64);
        for cand in self.pending_candidates.drain(..) {
            let _ = remote_tx.try_send(cand);
        }
        self.remote_cand_tx = Some(remote_tx);

        // Forward the dialer's local candidates to the peer.
        let signal = Arc::clone(&self.ctx.signal);
        let from = self.cfg.local_key;
        let to = self.cfg.key;
        self.candidate_fwd = Some(tokio::spawn(async move {
            while let Some(candidate) = local_rx.recv().await {
                let msg = SignalMessage {
                    from,
                    to,
                    body: SignalBody::Candidate { candidate },
                };
                if let Err(e) = signal.send(msg).await {
                    tracing::debug!(peer = %to.short(), "candidate send failed: {e}");
                }
            }
        }));

        let spec = DialSpec {
            peer: self.cfg.key,
            role,
            local,
            remote: IceCredentials {
                ufrag: remote.ufrag.clone(),
                pwd: remote.pwd.clone(),
            },
            // One snapshot per attempt; list swaps mid-dial are invisible.
            servers: self.ctx.ice.snapshot(),
            gathering: Arc::clone(&self.ctx.gathering),
            relay_hint: remote.relay_addr.clone(),
            remote_wg_port: remote.wg_port,
        };
        let dialer = Arc::clone(&self.ctx.dialer);
        let tx = self.internal_tx.clone();
        let epoch = self.epoch;
        self.dial_task = Some(tokio::spawn(async move {
            let result = dialer
                .dial(
                    spec,
                    DialerIo {
                        local_tx,
                        remote_rx,
                    },
                )
                .await;
            let _ = tx.send(Internal::DialDone(epoch, result)).await;
        }));
    }

    async fn on_dial_success(&mut self, transport: PeerTransport) {
        let PeerTransport {
            path,
            endpoint,
            disconnected,
        } = transport;

        self.permit = None; // release the admission slot
        self.ever_connected = true;
        self.attempts = 0;
        self.backoff = INITIAL_BACKOFF;
        self.ctx.status.reset_attempts(&self.cfg.key);

        let peer = TunnelPeer {
            key: self.cfg.key,
            allowed_ips: self.cfg.allowed_ips.as_ref().clone(),
            endpoint,
            keepalive: Some(self.cfg.keepalive),
            preshared_key: self.cfg.preshared_key.clone(),
        };
        if let Err(e) = self.ctx.tunnel.upsert_peer(peer).await {
            tracing::warn!(peer = %self.cfg.key.short(), "tunnel peer update failed: {e}");
            self.fail_attempt("tunnel update failed").await;
            return;
        }

        self.set_state(SessionState::Connected);
        self.ctx
            .status
            .set_status(&self.cfg.key, ConnStatus::Connected, Some(path.clone()));
        tracing::info!(peer = %self.cfg.key.short(), %path, "peer connected");

        if let Some(pq) = &self.ctx.pq {
            let remote = self.remote_payload.as_ref();
            // Signaling carries the freshest PQ key; the map's copy covers
            // peers that negotiated before their key reached the payload.
            let remote_key = remote
                .and_then(|p| p.pq_key.as_deref())
                .or(self.cfg.pq_public_key.as_deref());
            if let (Some(key), Some(addr)) = (remote_key, remote.and_then(|p| p.pq_addr.as_deref()))
            {
                pq.on_connected(&self.cfg.key, key, addr).await;
            }
        }

        // The watcher owns the disconnect receiver; dropping it (on abort)
        // is what tears the underlying path down.
        let tx = self.internal_tx.clone();
        let epoch = self.epoch;
        self.watch_task = Some(tokio::spawn(async move {
            let _ = disconnected.await;
            let _ = tx.send(Internal::TransportDown(epoch)).await;
        }));
    }

    async fn fail_attempt(&mut self, reason: &str) {
        tracing::debug!(
            peer = %self.cfg.key.short(),
            attempts = self.attempts,
            backoff = ?self.backoff,
            "attempt failed: {reason}"
        );
        self.abort_attempt();
        self.permit = None;
        self.set_state(SessionState::Failed);

        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(self.timeout);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::RetryNow).await;
        });
    }

    /// Lazy-mode quiesce: stop negotiating, keep the tunnel entry and the
    /// last exchanged payloads.
    async fn quiesce(&mut self) {
        if self.state() == SessionState::Closed {
            return;
        }
        if self.state() == SessionState::Connected {
            if let Some(pq) = &self.ctx.pq {
                pq.on_disconnected(&self.cfg.key).await;
            }
        }
        self.abort_attempt();
        self.permit = None;
        self.admission_pending = false;
        self.wants_respond = false;
        self.set_state(SessionState::Idle);
    }

    async fn close(&mut self, graceful: bool) {
        let state = self.state();
        if graceful && !matches!(state, SessionState::Idle | SessionState::Closed) {
            // Best-effort: tell the peer to stop negotiating with us.
            let msg = SignalMessage {
                from: self.cfg.local_key,
                to: self.cfg.key,
                body: SignalBody::GoIdle,
            };
            let _ = self.ctx.signal.send(msg).await;
        }
        if state == SessionState::Connected {
            if let Some(pq) = &self.ctx.pq {
                pq.on_disconnected(&self.cfg.key).await;
            }
        }
        self.abort_helpers();
        self.permit = None;
        self.set_state(SessionState::Closed);
    }

    /// Invalidate the current attempt: helper results carrying the old epoch
    /// are ignored, the dial task is aborted, and dropping the watcher's
    /// receiver closes the live transport if there is one. Credentials are
    /// cleared so the next attempt regenerates them and arms a fresh
    /// timeout.
    fn abort_attempt(&mut self) {
        self.epoch += 1;
        self.abort_helpers();
        self.remote_cand_tx = None;
        self.local_creds = None;
    }

    fn abort_helpers(&mut self) {
        if let Some(task) = self.dial_task.take() {
            task.abort();
        }
        if let Some(task) = self.candidate_fwd.take() {
            task.abort();
        }
        if let Some(task) = self.watch_task.take() {
            task.abort();
        }
    }

    fn arm_timeout(&self) {
        let tx = self.internal_tx.clone();
        let epoch = self.epoch;
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Internal::NegotiationTimeout(epoch)).await;
        });
    }

    fn local_payload(&self) -> SessionPayload {
        let creds = self.local_creds.as_ref().expect("credentials generated before payload");
        let credential_sig = match &self.cfg.preshared_key {
            Some(psk) => signal::sign_credentials(psk.as_bytes(), &creds.ufrag, &creds.pwd),
            None => String::new(),
        };
        let servers = self.ctx.ice.snapshot();
        SessionPayload {
            ufrag: creds.ufrag.clone(),
            pwd: creds.pwd.clone(),
            credential_sig,
            wg_port: Some(self.cfg.wg_port),
            pq_key: self.ctx.pq.as_ref().map(|pq| pq.public_key()),
            pq_addr: self.ctx.pq.as_ref().map(|pq| pq.listen_addr()),
            relay_addr: servers.relay_addr().map(String::from),
        }
    }

    fn verify_credentials(&self, payload: &SessionPayload) -> bool {
        match &self.cfg.preshared_key {
            Some(psk) => signal::verify_credentials(
                psk.as_bytes(),
                &payload.ufrag,
                &payload.pwd,
                &payload.credential_sig,
            ),
            // No shared secret for this pair; nothing to verify against.
            None => true,
        }
    }
}

fn generate_credentials() -> IceCredentials {
    let mut rng = rand::thread_rng();
    let mut sample = |len: usize| -> String {
        (&mut rng)
            .sample_iter(rand::distributions::Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    };
    IceCredentials {
        ufrag: sample(8),
        pwd: sample(22),
    }
}

/// Extract the connection address from an ICE candidate line
/// (`[candidate:]foundation component transport priority address port typ ...`).
fn candidate_ip(candidate: &str) -> Option<IpAddr> {
    let trimmed = candidate.strip_prefix("candidate:").unwrap_or(candidate);
    trimmed.split_whitespace().nth(4)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_ip_parses_standard_lines() {
        let cand = "candidate:842163049 1 udp 1677729535 192.0.2.7 51820 typ srflx raddr 0.0.0.0";
        assert_eq!(candidate_ip(cand), Some("192.0.2.7".parse().unwrap()));

        let bare = "842163049 1 udp 1677729535 2001:db8::7 51820 typ host";
        assert_eq!(candidate_ip(bare), Some("2001:db8::7".parse().unwrap()));

        assert_eq!(candidate_ip("malformed"), None);
    }

    #[test]
    fn credentials_have_expected_shape() {
        let a = generate_credentials();
        let b = generate_credentials();
        assert_eq!(a.ufrag.len(), 8);
        assert_eq!(a.pwd.len(), 22);
        assert_ne!(a.pwd, b.pwd);
    }
}
