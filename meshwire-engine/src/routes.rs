//! Route plan parsing and classification.
//!
//! The map carries routes as raw strings; here they become typed entries,
//! split into server routes (we are the gateway) and client routes (we
//! subscribe), with high-availability groups extracted for the connection
//! manager.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::Mutex;

use meshwire_proto::PeerKey;
use meshwire_proto::map::Route;

use crate::error::ReconcileError;

/// A validated route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub id: String,
    pub network: IpNet,
    pub gateway: PeerKey,
    pub metric: u32,
    pub masquerade: bool,
    pub ha_group: Option<String>,
}

/// Parse raw routes, skipping entries with invalid networks and aggregating
/// the failures.
pub fn parse_routes(routes: &[Route], errors: &mut Vec<ReconcileError>) -> Vec<RouteEntry> {
    let mut out = Vec::with_capacity(routes.len());
    for route in routes {
        match route.network.parse::<IpNet>() {
            Ok(network) => out.push(RouteEntry {
                id: route.id.clone(),
                network,
                gateway: route.peer,
                metric: route.metric,
                masquerade: route.masquerade,
                ha_group: route.ha_group.clone(),
            }),
            Err(e) => errors.push(ReconcileError::RouteNetwork {
                id: route.id.clone(),
                entry: route.network.clone(),
                reason: e.to_string(),
            }),
        }
    }
    out
}

/// Split into (server, client) routes relative to the local key.
pub fn classify(entries: Vec<RouteEntry>, local: &PeerKey) -> (Vec<RouteEntry>, Vec<RouteEntry>) {
    entries.into_iter().partition(|r| r.gateway == *local)
}

/// Group client routes by HA group id. Ungrouped routes are keyed by their
/// own id, so every client route resolves to exactly one group.
pub fn ha_groups(client: &[RouteEntry]) -> HashMap<String, Vec<PeerKey>> {
    let mut groups: HashMap<String, Vec<PeerKey>> = HashMap::new();
    for route in client {
        let group = route.ha_group.clone().unwrap_or_else(|| route.id.clone());
        let members = groups.entry(group).or_default();
        if !members.contains(&route.gateway) {
            members.push(route.gateway);
        }
    }
    groups
}

/// Compare a typed allowed-IP set against its string form as multisets.
/// Symmetric and order-insensitive; any unparseable string makes the sets
/// unequal.
pub fn compare_allowed_ips(nets: &[IpNet], raw: &[String]) -> bool {
    if nets.len() != raw.len() {
        return false;
    }
    let mut parsed: Vec<IpNet> = Vec::with_capacity(raw.len());
    for s in raw {
        match s.parse() {
            Ok(net) => parsed.push(net),
            Err(_) => return false,
        }
    }
    let mut lhs: Vec<IpNet> = nets.to_vec();
    lhs.sort();
    parsed.sort();
    lhs == parsed
}

/// The current client-route prefixes, swapped on reconcile and snapshotted
/// by the signal router when it forwards candidates: a candidate claiming an
/// address inside a routed prefix would loop traffic back into the tunnel.
#[derive(Default)]
pub struct ClientRoutesView {
    inner: Mutex<Arc<Vec<IpNet>>>,
}

impl ClientRoutesView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Vec<IpNet>> {
        self.inner.lock().clone()
    }

    pub fn replace(&self, prefixes: Vec<IpNet>) {
        *self.inner.lock() = Arc::new(prefixes);
    }
}

/// True when `ip` falls inside any of the given prefixes.
pub fn ip_in_routes(ip: IpAddr, routes: &[IpNet]) -> bool {
    routes.iter().any(|net| net.contains(&ip))
}
