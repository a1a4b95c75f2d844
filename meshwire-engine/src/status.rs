//! Status ledger: the engine's observable state, for UIs and diagnostics.
//!
//! Consumers either poll [`StatusLedger::snapshot`] or subscribe to the
//! broadcast stream of [`EngineEvent`]s, mirroring how a client UI follows a
//! connection.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use meshwire_proto::PeerKey;

use crate::collab::{TransferStats, TransportPath};
use crate::error::ShutdownReason;

/// Coarse per-peer connection state shown to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub key: PeerKey,
    pub fqdn: String,
    pub status: ConnStatus,
    pub path: Option<TransportPath>,
    pub last_change: DateTime<Utc>,
    pub transfer: Option<TransferStats>,
    /// Dial attempts since the last successful connection.
    pub attempts: u32,
}

/// Events emitted as the engine's state changes.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    PeerStateChanged { key: PeerKey, status: ConnStatus },
    PeerRemoved { key: PeerKey },
    MapApplied { serial: u64 },
    LocalAddressChanged { address: String },
    Stopping { reason: ShutdownReason },
}

pub struct StatusLedger {
    peers: Mutex<HashMap<PeerKey, PeerStatus>>,
    offline: Mutex<Vec<(PeerKey, String)>>,
    events: broadcast::Sender<EngineEvent>,
}

impl Default for StatusLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusLedger {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            peers: Mutex::new(HashMap::new()),
            offline: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        // No subscribers is fine; events are best-effort.
        let _ = self.events.send(event);
    }

    /// Create or refresh a peer entry, keeping continuity (status, counters)
    /// when the peer already exists: a recreated session is still the same
    /// peer to an observer.
    pub fn upsert_peer(&self, key: PeerKey, fqdn: &str, initial: ConnStatus) {
        let mut peers = self.peers.lock();
        peers
            .entry(key)
            .and_modify(|p| {
                if !fqdn.is_empty() {
                    p.fqdn = fqdn.to_string();
                }
            })
            .or_insert_with(|| PeerStatus {
                key,
                fqdn: fqdn.to_string(),
                status: initial,
                path: None,
                last_change: Utc::now(),
                transfer: None,
                attempts: 0,
            });
    }

    pub fn set_status(&self, key: &PeerKey, status: ConnStatus, path: Option<TransportPath>) {
        let mut peers = self.peers.lock();
        let Some(peer) = peers.get_mut(key) else {
            return;
        };
        let changed = peer.status != status;
        peer.status = status;
        peer.path = path;
        peer.last_change = Utc::now();
        drop(peers);
        if changed {
            self.emit(EngineEvent::PeerStateChanged { key: *key, status });
        }
    }

    pub fn record_attempt(&self, key: &PeerKey) {
        if let Some(peer) = self.peers.lock().get_mut(key) {
            peer.attempts = peer.attempts.saturating_add(1);
        }
    }

    pub fn reset_attempts(&self, key: &PeerKey) {
        if let Some(peer) = self.peers.lock().get_mut(key) {
            peer.attempts = 0;
        }
    }

    pub fn set_transfer(&self, key: &PeerKey, stats: TransferStats) {
        if let Some(peer) = self.peers.lock().get_mut(key) {
            peer.transfer = Some(stats);
        }
    }

    pub fn remove_peer(&self, key: &PeerKey) {
        if self.peers.lock().remove(key).is_some() {
            self.emit(EngineEvent::PeerRemoved { key: *key });
        }
    }

    pub fn get(&self, key: &PeerKey) -> Option<PeerStatus> {
        self.peers.lock().get(key).cloned()
    }

    pub fn snapshot(&self) -> Vec<PeerStatus> {
        self.peers.lock().values().cloned().collect()
    }

    /// Replace the offline set wholesale, as the map delivers it.
    pub fn replace_offline(&self, peers: Vec<(PeerKey, String)>) {
        *self.offline.lock() = peers;
    }

    pub fn offline(&self) -> Vec<(PeerKey, String)> {
        self.offline.lock().clone()
    }

    pub fn clear(&self) {
        self.peers.lock().clear();
        self.offline.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> PeerKey {
        PeerKey::from_bytes([n; 32])
    }

    #[test]
    fn upsert_preserves_continuity() {
        let ledger = StatusLedger::new();
        ledger.upsert_peer(key(1), "a.mesh", ConnStatus::Connecting);
        ledger.set_status(&key(1), ConnStatus::Connected, None);

        // Re-adding the peer (session recreate) keeps the observed status.
        ledger.upsert_peer(key(1), "a.mesh", ConnStatus::Connecting);
        assert_eq!(ledger.get(&key(1)).unwrap().status, ConnStatus::Connected);
    }

    #[test]
    fn state_change_emits_event() {
        let ledger = StatusLedger::new();
        let mut rx = ledger.subscribe();
        ledger.upsert_peer(key(2), "b.mesh", ConnStatus::Idle);
        ledger.set_status(&key(2), ConnStatus::Connecting, None);

        match rx.try_recv().unwrap() {
            EngineEvent::PeerStateChanged { key: k, status } => {
                assert_eq!(k, key(2));
                assert_eq!(status, ConnStatus::Connecting);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn offline_set_is_replaced_wholesale() {
        let ledger = StatusLedger::new();
        ledger.replace_offline(vec![(key(3), "c.mesh".into())]);
        ledger.replace_offline(vec![(key(4), "d.mesh".into())]);
        let offline = ledger.offline();
        assert_eq!(offline.len(), 1);
        assert_eq!(offline[0].0, key(4));
    }
}
