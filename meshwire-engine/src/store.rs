//! Indexed collection of live peer sessions.
//!
//! Writes happen under the engine's control mutex (reconciliation and
//! lifecycle); reads are lock-free for callers via snapshot returns, so the
//! signal router and health sweep never hold the map open while they work.

use std::collections::HashMap;
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::RwLock;

use meshwire_proto::PeerKey;

use crate::session::SessionHandle;

#[derive(Default)]
pub struct PeerStore {
    inner: RwLock<HashMap<PeerKey, SessionHandle>>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session. Idempotent: returns `false` and leaves the existing
    /// session in place when the key is already present.
    pub fn add(&self, key: PeerKey, session: SessionHandle) -> bool {
        let mut inner = self.inner.write();
        if inner.contains_key(&key) {
            return false;
        }
        inner.insert(key, session);
        true
    }

    pub fn get(&self, key: &PeerKey) -> Option<SessionHandle> {
        self.inner.read().get(key).cloned()
    }

    pub fn remove(&self, key: &PeerKey) -> Option<SessionHandle> {
        self.inner.write().remove(key)
    }

    pub fn contains(&self, key: &PeerKey) -> bool {
        self.inner.read().contains_key(key)
    }

    /// Snapshot of the current keys; safe to iterate while sessions churn.
    pub fn keys(&self) -> Vec<PeerKey> {
        self.inner.read().keys().copied().collect()
    }

    /// Snapshot of a peer's allowed IPs.
    pub fn allowed_ips(&self, key: &PeerKey) -> Option<Arc<Vec<IpNet>>> {
        self.inner.read().get(key).map(|s| s.allowed_ips())
    }

    /// Snapshot of all sessions, for sweeps.
    pub fn sessions(&self) -> Vec<SessionHandle> {
        self.inner.read().values().cloned().collect()
    }

    /// The peer whose allowed IPs contain `ip`, if any.
    pub fn peer_for_ip(&self, ip: std::net::IpAddr) -> Option<PeerKey> {
        let inner = self.inner.read();
        inner
            .iter()
            .find(|(_, session)| session.allowed_ips().iter().any(|net| net.contains(&ip)))
            .map(|(key, _)| *key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
