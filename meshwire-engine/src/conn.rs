//! Connection activation policy.
//!
//! Eager mode opens every session as soon as the map delivers the peer. Lazy
//! mode leaves sessions idle until demand shows up: an inbound signal, local
//! traffic toward one of the peer's allowed IPs, traffic into a
//! high-availability route group the peer serves, or membership in the
//! always-active exclusion set (ingress-forwarding targets must never idle).

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use meshwire_proto::PeerKey;

use crate::routes::RouteEntry;
use crate::session::SessionState;
use crate::store::PeerStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPolicy {
    Eager,
    Lazy,
}

pub struct ConnectionManager {
    store: Arc<PeerStore>,
    policy: Mutex<ConnectionPolicy>,
    /// HA group id → member gateways, announced before routes apply.
    ha_groups: Mutex<HashMap<String, Vec<PeerKey>>>,
    /// Client route prefixes → owning HA group, for traffic-driven wake.
    route_groups: Mutex<Vec<(ipnet::IpNet, String)>>,
    /// Peers that must always be eager regardless of policy.
    always_active: Mutex<HashSet<PeerKey>>,
}

impl ConnectionManager {
    pub fn new(store: Arc<PeerStore>, policy: ConnectionPolicy) -> Self {
        Self {
            store,
            policy: Mutex::new(policy),
            ha_groups: Mutex::new(HashMap::new()),
            route_groups: Mutex::new(Vec::new()),
            always_active: Mutex::new(HashSet::new()),
        }
    }

    pub fn policy(&self) -> ConnectionPolicy {
        *self.policy.lock()
    }

    /// Update the policy from the map's feature flag. Returns `true` when it
    /// changed; the reconciler then quiesces or opens existing sessions.
    pub fn set_policy(&self, policy: ConnectionPolicy) -> bool {
        let mut current = self.policy.lock();
        if *current == policy {
            return false;
        }
        *current = policy;
        true
    }

    /// Announce HA groups for the upcoming route application, so wake by
    /// route membership resolves against the same map that created the
    /// routes.
    pub fn set_ha_groups(
        &self,
        groups: HashMap<String, Vec<PeerKey>>,
        route_groups: Vec<(ipnet::IpNet, String)>,
    ) {
        *self.ha_groups.lock() = groups;
        *self.route_groups.lock() = route_groups;
    }

    /// Replace the always-active set (ingress-forwarding targets).
    pub fn set_always_active(&self, peers: HashSet<PeerKey>) {
        *self.always_active.lock() = peers;
    }

    fn is_always_active(&self, key: &PeerKey) -> bool {
        self.always_active.lock().contains(key)
    }

    /// Apply policy to a freshly created session.
    pub async fn on_peer_added(&self, key: &PeerKey) {
        let open = match self.policy() {
            ConnectionPolicy::Eager => true,
            ConnectionPolicy::Lazy => self.is_always_active(key),
        };
        if open {
            if let Some(session) = self.store.get(key) {
                session.open().await;
            }
        }
    }

    /// Wake a lazy session. Used by the signal router for any inbound
    /// message other than `GoIdle`. Returns whether a session existed.
    pub async fn activate(&self, key: &PeerKey) -> bool {
        match self.store.get(key) {
            Some(session) => {
                if session.state() == SessionState::Idle {
                    session.activate().await;
                }
                true
            }
            None => false,
        }
    }

    /// Local traffic was observed toward `dst`. Wake the owning peer, or the
    /// whole HA group when the destination sits behind a routed prefix.
    pub async fn notice_traffic(&self, dst: IpAddr) {
        if let Some(key) = self.store.peer_for_ip(dst) {
            self.activate(&key).await;
            return;
        }
        let group = self
            .route_groups
            .lock()
            .iter()
            .find(|(net, _)| net.contains(&dst))
            .map(|(_, group)| group.clone());
        if let Some(group) = group {
            let members = self.ha_groups.lock().get(&group).cloned().unwrap_or_default();
            for key in members {
                self.activate(&key).await;
            }
        }
    }

    /// Bring existing sessions in line after a policy flip: lazy quiesces
    /// everything outside the always-active set, eager opens everything.
    pub async fn apply_policy_change(&self) {
        match self.policy() {
            ConnectionPolicy::Eager => {
                for session in self.store.sessions() {
                    session.open().await;
                }
            }
            ConnectionPolicy::Lazy => {
                for session in self.store.sessions() {
                    if !self.is_always_active(&session.key()) {
                        session.deactivate().await;
                    }
                }
            }
        }
    }

    /// Forget per-peer bookkeeping on removal.
    pub fn forget(&self, key: &PeerKey) {
        self.always_active.lock().remove(key);
        for members in self.ha_groups.lock().values_mut() {
            members.retain(|k| k != key);
        }
    }
}

/// Build the prefix → group mapping the manager needs from classified client
/// routes.
pub fn route_groups(client_routes: &[RouteEntry]) -> Vec<(ipnet::IpNet, String)> {
    client_routes
        .iter()
        .map(|r| {
            let group = r.ha_group.clone().unwrap_or_else(|| r.id.clone());
            (r.network, group)
        })
        .collect()
}
