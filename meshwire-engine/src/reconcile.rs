//! Network-map reconciliation.
//!
//! Runs under the control mutex with a map whose serial is newer than the
//! last applied one. Malformed entries (bad CIDR, unknown protocol, bad
//! URI) are skipped and aggregated; the rest of the map still applies and
//! the serial still advances. Only infrastructure failures (the tunnel
//! refusing its address) abort the pass, leaving the serial untouched so
//! the next frame retries idempotently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;

use meshwire_proto::PeerKey;
use meshwire_proto::control::{ControlConfig, SyncResponse};
use meshwire_proto::map::{ForwardRule, NetworkMap, PeerDescriptor, Protocol, RelayConfig};

use crate::collab::{ForwardEntry, TunnelPeer};
use crate::conn::{self, ConnectionPolicy};
use crate::engine::{ControlState, EngineShared, SESSION_CLOSE_TIMEOUT};
use crate::error::{EngineError, ReconcileError};
use crate::ice::{self, IceServers};
use crate::routes;
use crate::session::{self, SessionConfig};
use crate::status::{ConnStatus, EngineEvent};

/// Default persistent keepalive for tunnel peers.
const PEER_KEEPALIVE: Duration = Duration::from_secs(25);

/// Apply one control frame: config first (it feeds the traversal snapshot
/// the map's sessions will read), then the map.
pub(crate) async fn apply_sync(
    shared: &Arc<EngineShared>,
    state: &mut ControlState,
    sync: SyncResponse,
) -> Result<(), EngineError> {
    if let Some(config) = sync.config {
        apply_control_config(shared, &config).await;
    }
    if let Some(map) = sync.network_map {
        apply_network_map(shared, state, map).await?;
    }
    Ok(())
}

/// Out-of-band infrastructure config: replace the STUN/TURN/relay snapshot.
async fn apply_control_config(shared: &Arc<EngineShared>, config: &ControlConfig) {
    let mut errors = Vec::new();
    let next = build_ice_servers(
        &config.stuns,
        &config.turns,
        config.relay.clone(),
        &mut errors,
    );
    let prev = shared.ice.swap(next);
    maybe_warm_relay(shared, prev.is_empty(), config.relay.as_ref()).await;
    if let Some(flow) = &config.flow {
        // Flow telemetry is collected outside the engine; just surface it.
        tracing::debug!(url = %flow.url, "flow config updated");
    }
    log_skipped(&errors);
}

/// The reconciliation pass proper. Caller holds the control mutex.
pub(crate) async fn apply_network_map(
    shared: &Arc<EngineShared>,
    state: &mut ControlState,
    map: NetworkMap,
) -> Result<(), EngineError> {
    if map.serial <= state.last_applied {
        tracing::info!(
            serial = map.serial,
            last_applied = state.last_applied,
            "ignoring stale network map"
        );
        return Ok(());
    }
    tracing::debug!(serial = map.serial, peers = map.peers.len(), "applying network map");
    let mut errors: Vec<ReconcileError> = Vec::new();

    // 1. Local peer config. An address failure is infrastructure-fatal and
    // leaves the serial untouched for a retry.
    if !map.local.address.is_empty() {
        match map.local.address.parse::<IpNet>() {
            Ok(addr) => {
                let current = shared.ops.tunnel.address().ok();
                if current != Some(addr) {
                    shared.ops.tunnel.set_address(addr).await?;
                    shared.status.emit(EngineEvent::LocalAddressChanged {
                        address: map.local.address.clone(),
                    });
                }
            }
            Err(e) => errors.push(ReconcileError::Manager {
                manager: "tunnel",
                reason: format!("invalid local address {:?}: {e}", map.local.address),
            }),
        }
    }

    // Connection policy flag; takes effect now, quiescing or opening the
    // existing set.
    if let Some(lazy) = map.local.lazy_connection {
        let policy = if lazy {
            ConnectionPolicy::Lazy
        } else {
            ConnectionPolicy::Eager
        };
        if shared.conn.set_policy(policy) {
            tracing::info!(?policy, "connection policy changed by management");
            shared.conn.apply_policy_change().await;
        }
    }

    // 2. Relay/STUN/TURN snapshot swap.
    if !map.stuns.is_empty() || !map.turns.is_empty() || map.relay.is_some() {
        let next = build_ice_servers(&map.stuns, &map.turns, map.relay.clone(), &mut errors);
        let prev = shared.ice.swap(next);
        maybe_warm_relay(shared, prev.is_empty(), map.relay.as_ref()).await;
    }

    // 3. Firewall rules and the legacy-mode toggle.
    if let Some(firewall) = shared.ops.firewall() {
        if let Err(e) = firewall.apply_peer_rules(&map.firewall_rules).await {
            errors.push(ReconcileError::Manager {
                manager: "firewall",
                reason: e.to_string(),
            });
        }
        if let Err(e) = firewall.apply_route_rules(&map.routes_firewall_rules).await {
            errors.push(ReconcileError::Manager {
                manager: "firewall",
                reason: e.to_string(),
            });
        }
        firewall.set_legacy_mode(legacy_firewall_mode(&map));
    }

    // 4. Route plan. HA groups reach the connection manager before the
    // routes land so traffic-driven wake resolves against this same map.
    let parsed = routes::parse_routes(&map.routes, &mut errors);
    let (mut server_routes, mut client_routes) = routes::classify(parsed, &shared.local_key);
    if shared.cfg.disable_server_routes {
        server_routes.clear();
    }
    if shared.cfg.disable_client_routes {
        client_routes.clear();
    }
    shared.conn.set_ha_groups(
        routes::ha_groups(&client_routes),
        conn::route_groups(&client_routes),
    );
    shared
        .client_routes
        .replace(client_routes.iter().map(|r| r.network).collect());
    if !shared.cfg.disable_dns {
        if let Err(e) = shared.ops.dns.update_server(&map.dns).await {
            errors.push(ReconcileError::Manager {
                manager: "dns",
                reason: e.to_string(),
            });
        }
        let forward_domains: Vec<String> = map
            .dns
            .nameserver_groups
            .iter()
            .flat_map(|g| g.domains.iter().cloned())
            .collect();
        if let Err(e) = shared.ops.dns.update_forwarder(&forward_domains).await {
            errors.push(ReconcileError::Manager {
                manager: "dns",
                reason: e.to_string(),
            });
        }
    }
    if let Err(e) = shared.ops.routes.update(&server_routes, &client_routes).await {
        errors.push(ReconcileError::Manager {
            manager: "routes",
            reason: e.to_string(),
        });
    }

    // 5. Peer set diff. An empty peer list only means "remove everyone"
    // when the map marks it as deliberately empty.
    let skip_peer_diff = map.peers.is_empty() && !map.remote_peers_is_empty;
    if !skip_peer_diff {
        let desired: HashMap<PeerKey, &PeerDescriptor> =
            map.peers.iter().map(|p| (p.key, p)).collect();

        for key in shared.store.keys() {
            if !desired.contains_key(&key) {
                remove_peer(shared, &key, true, &mut errors).await;
            }
        }

        let mut to_recreate = Vec::new();
        for (key, desc) in &desired {
            if let Some(session) = shared.store.get(key) {
                let version_changed = session.agent_version() != desc.agent_version;
                let ips_changed =
                    !routes::compare_allowed_ips(&session.allowed_ips(), &desc.allowed_ips);
                if version_changed || ips_changed {
                    // Close-and-recreate rather than mutate in place; a
                    // version-only change still churns the session, which is
                    // surfaced here for the operator.
                    tracing::debug!(
                        peer = %key.short(),
                        version_changed,
                        ips_changed,
                        "peer changed, recreating session"
                    );
                    to_recreate.push(*key);
                }
            }
        }
        for key in to_recreate {
            remove_peer(shared, &key, false, &mut errors).await;
            if let Some(desc) = desired.get(&key) {
                add_peer(shared, desc, &mut errors).await;
            }
        }

        for desc in &map.peers {
            if !shared.store.contains(&desc.key) {
                add_peer(shared, desc, &mut errors).await;
            }
        }
    }

    // 6. SSH authorized keys for the remaining peer set.
    if shared.cfg.ssh_server_enabled() {
        if let Some(ssh) = &shared.ops.ssh {
            let keys: Vec<(PeerKey, String)> = shared
                .store
                .sessions()
                .iter()
                .filter_map(|s| s.ssh_public_key().map(|k| (s.key(), k.to_string())))
                .collect();
            if let Err(e) = ssh.replace(keys).await {
                errors.push(ReconcileError::Manager {
                    manager: "ssh",
                    reason: e.to_string(),
                });
            }
        }
    }

    // 7. Ingress forwarding. Translated peers must never idle in lazy mode.
    let forward = parse_forwarding(&map.forwarding_rules, &mut errors);
    let translated: HashSet<PeerKey> = forward.iter().map(|f| f.translated_peer).collect();
    shared.conn.set_always_active(translated.clone());
    for key in &translated {
        shared.conn.activate(key).await;
    }
    if let Some(firewall) = shared.ops.firewall() {
        if let Err(e) = firewall.apply_forwarding(&forward).await {
            errors.push(ReconcileError::Manager {
                manager: "firewall",
                reason: e.to_string(),
            });
        }
    }

    // 8. Offline peers, replaced wholesale.
    shared.status.replace_offline(
        map.offline_peers
            .iter()
            .map(|p| (p.key, p.fqdn.clone()))
            .collect(),
    );

    // 9. Serial last: a pass that failed before this point retries on the
    // next frame.
    state.last_applied = map.serial;
    if let Some(statefile) = &shared.statefile {
        if let Err(e) = statefile.put("last_map_serial", &map.serial) {
            tracing::warn!("failed to persist map serial: {e}");
        }
    }
    log_skipped(&errors);
    shared.status.emit(EngineEvent::MapApplied { serial: map.serial });
    tracing::info!(serial = map.serial, peers = shared.store.len(), "network map applied");
    Ok(())
}

/// Legacy firewall compatibility: control planes that predate route rules
/// send neither rules nor the explicit empty marker.
// TODO: replace with a control-plane capability bit once management
// advertises one; inferring from absence is fragile.
fn legacy_firewall_mode(map: &NetworkMap) -> bool {
    map.routes_firewall_rules.is_empty() && !map.routes_firewall_rules_is_empty
}

fn build_ice_servers(
    stuns: &[String],
    turns: &[String],
    relay: Option<RelayConfig>,
    errors: &mut Vec<ReconcileError>,
) -> IceServers {
    let mut servers = IceServers {
        relay,
        ..Default::default()
    };
    for uri in stuns {
        match ice::parse_stun_uri(uri) {
            Ok(parsed) => servers.stuns.push(parsed),
            Err(e) => errors.push(e),
        }
    }
    for uri in turns {
        match ice::parse_turn_uri(uri) {
            Ok(parsed) => servers.turns.push(parsed),
            Err(e) => errors.push(e),
        }
    }
    servers
}

/// Opportunistically connect to relay infrastructure the first time it
/// appears.
async fn maybe_warm_relay(
    shared: &Arc<EngineShared>,
    was_empty: bool,
    relay: Option<&RelayConfig>,
) {
    if !was_empty {
        return;
    }
    if let Some(relay) = relay {
        if let Err(e) = shared.ops.dialer.prepare_relay(relay).await {
            tracing::warn!("relay warm-up failed: {e}");
        }
    }
}

fn parse_forwarding(rules: &[ForwardRule], errors: &mut Vec<ReconcileError>) -> Vec<ForwardEntry> {
    let mut out = Vec::with_capacity(rules.len());
    for rule in rules {
        let protocol = match rule.protocol.to_ascii_lowercase().as_str() {
            "all" => Protocol::All,
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            "icmp" => Protocol::Icmp,
            other => {
                errors.push(ReconcileError::ForwardProtocol {
                    protocol: other.to_string(),
                    port: rule.ingress_port,
                });
                continue;
            }
        };
        out.push(ForwardEntry {
            protocol,
            ingress_port: rule.ingress_port,
            translated_peer: rule.translated_peer,
            translated_port: rule.translated_port,
        });
    }
    out
}

/// Remove one peer: session, tunnel entry, status, SSH key and connection
/// bookkeeping go together under the control mutex, so callers observe the
/// removal as atomic. `drop_status=false` keeps the ledger entry for a
/// recreate, so observers see the peer as continuously present.
async fn remove_peer(
    shared: &Arc<EngineShared>,
    key: &PeerKey,
    drop_status: bool,
    errors: &mut Vec<ReconcileError>,
) {
    shared.conn.forget(key);
    if let Some(session) = shared.store.remove(key) {
        if tokio::time::timeout(SESSION_CLOSE_TIMEOUT, session.close(true))
            .await
            .is_err()
        {
            tracing::warn!(peer = %key.short(), "session did not close in time, abandoning");
        }
    }
    if let Err(e) = shared.ops.tunnel.remove_peer(key).await {
        errors.push(ReconcileError::Manager {
            manager: "tunnel",
            reason: format!("removing peer {}: {e}", key.short()),
        });
    }
    if drop_status {
        shared.status.remove_peer(key);
    }
    if let Some(ssh) = &shared.ops.ssh {
        ssh.remove(key).await;
    }
}

/// Create a session for a new peer: parse its allowed IPs (bad entries are
/// skipped), install the tunnel entry and status row, then let the
/// connection manager decide whether to open.
async fn add_peer(
    shared: &Arc<EngineShared>,
    desc: &PeerDescriptor,
    errors: &mut Vec<ReconcileError>,
) {
    let mut allowed_ips = Vec::with_capacity(desc.allowed_ips.len());
    for raw in &desc.allowed_ips {
        match raw.parse::<IpNet>() {
            Ok(net) => allowed_ips.push(net),
            Err(e) => errors.push(ReconcileError::AllowedIp {
                peer: desc.key,
                entry: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }
    let allowed_ips = Arc::new(allowed_ips);

    let cfg = SessionConfig {
        key: desc.key,
        local_key: shared.local_key,
        fqdn: desc.fqdn.clone(),
        agent_version: desc.agent_version.clone(),
        allowed_ips: Arc::clone(&allowed_ips),
        ssh_public_key: desc.ssh_public_key.clone(),
        pq_public_key: desc.pq_public_key.clone(),
        wg_port: shared.cfg.wg_port,
        preshared_key: shared.cfg.pre_shared_key.clone(),
        keepalive: PEER_KEEPALIVE,
    };
    let session = session::spawn(cfg, shared.session_ctx());
    if !shared.store.add(desc.key, session) {
        // Diff logic guarantees absence; a hit here means a bug upstream.
        tracing::warn!(peer = %desc.key.short(), "session already present, keeping existing");
        return;
    }

    if let Err(e) = shared
        .ops
        .tunnel
        .upsert_peer(TunnelPeer {
            key: desc.key,
            allowed_ips: allowed_ips.as_ref().clone(),
            endpoint: None,
            keepalive: Some(PEER_KEEPALIVE),
            preshared_key: shared.cfg.pre_shared_key.clone(),
        })
        .await
    {
        errors.push(ReconcileError::Manager {
            manager: "tunnel",
            reason: format!("adding peer {}: {e}", desc.key.short()),
        });
    }
    shared
        .status
        .upsert_peer(desc.key, &desc.fqdn, ConnStatus::Idle);
    shared.conn.on_peer_added(&desc.key).await;
}

fn log_skipped(errors: &[ReconcileError]) {
    if errors.is_empty() {
        return;
    }
    tracing::warn!(count = errors.len(), "skipped map entries during reconciliation");
    for error in errors {
        tracing::warn!("  {error}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> PeerKey {
        PeerKey::from_bytes([n; 32])
    }

    #[test]
    fn legacy_mode_needs_absence_of_rules_and_marker() {
        let mut map: NetworkMap = serde_json::from_str(
            r#"{"serial": 1, "local": {"address": "100.64.0.1/16"}}"#,
        )
        .unwrap();
        assert!(legacy_firewall_mode(&map));

        map.routes_firewall_rules_is_empty = true;
        assert!(!legacy_firewall_mode(&map));
    }

    #[test]
    fn unknown_forward_protocol_is_skipped() {
        let rules = vec![
            ForwardRule {
                protocol: "tcp".into(),
                ingress_port: 443,
                translated_peer: key(1),
                translated_port: 8443,
            },
            ForwardRule {
                protocol: "sctp".into(),
                ingress_port: 9,
                translated_peer: key(2),
                translated_port: 9,
            },
        ];
        let mut errors = Vec::new();
        let parsed = parse_forwarding(&rules, &mut errors);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].protocol, Protocol::Tcp);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn ice_parse_errors_do_not_drop_good_servers() {
        let mut errors = Vec::new();
        let servers = build_ice_servers(
            &["stun:good.example.net:3478".into(), "bogus".into()],
            &[],
            None,
            &mut errors,
        );
        assert_eq!(servers.stuns.len(), 1);
        assert_eq!(errors.len(), 1);
    }
}
