//! End-to-end engine scenarios against mock collaborators.
//!
//! Each test boots a full engine, feeds maps through the control stream and
//! signaling through the signal stream, and asserts on what reached the
//! mocks and the status ledger.

mod support;

use std::collections::HashSet;

use meshwire_engine::{ConnStatus, EngineConfig, ShutdownReason};
use meshwire_proto::map::PeerDescriptor;
use meshwire_proto::signal::SignalBody;

use support::{key, map, offer_payload, peer, settle, wait_for, DialMode, Harness};

fn eager_config() -> EngineConfig {
    EngineConfig {
        wg_addr: "100.64.0.1/16".into(),
        lazy_connection_enabled: false,
        ..Default::default()
    }
}

fn lazy_config() -> EngineConfig {
    EngineConfig {
        lazy_connection_enabled: true,
        ..eager_config()
    }
}

#[tokio::test]
async fn cold_start_two_peers_eager() {
    let h = Harness::start(eager_config()).await;
    // Keep sessions negotiating so we observe the "connecting" plateau.
    h.dialer.set_mode(DialMode::Pend);

    h.push_map(map(
        1,
        vec![peer(1, &["10.0.0.2/32"]), peer(2, &["10.0.0.3/32"])],
    ))
    .await;

    wait_for(
        || h.signal_tx.count(&key(1), "offer") == 1 && h.signal_tx.count(&key(2), "offer") == 1,
        "offers for both peers",
    )
    .await;

    // Tunnel peer table carries both entries with the map's allowed IPs.
    assert_eq!(
        h.tunnel.allowed_ips(&key(1)),
        Some(vec!["10.0.0.2/32".parse().unwrap()])
    );
    assert_eq!(
        h.tunnel.allowed_ips(&key(2)),
        Some(vec!["10.0.0.3/32".parse().unwrap()])
    );

    // Both report as connecting in the ledger.
    assert_eq!(h.peer_status(&key(1)), Some(ConnStatus::Connecting));
    assert_eq!(h.peer_status(&key(2)), Some(ConnStatus::Connecting));

    h.engine.stop().await;
}

#[tokio::test]
async fn lazy_mode_leaves_sessions_idle() {
    let h = Harness::start(lazy_config()).await;
    h.push_map(map(
        1,
        vec![peer(1, &["10.0.0.2/32"]), peer(2, &["10.0.0.3/32"])],
    ))
    .await;

    wait_for(
        || h.peer_status(&key(1)).is_some() && h.peer_status(&key(2)).is_some(),
        "both peers in the ledger",
    )
    .await;
    settle().await;

    // No gathering started: no offers, no dial attempts.
    assert_eq!(h.signal_tx.total("offer"), 0);
    assert!(h.dialer.dials.lock().is_empty());
    assert_eq!(h.peer_status(&key(1)), Some(ConnStatus::Idle));
    assert_eq!(h.peer_status(&key(2)), Some(ConnStatus::Idle));

    h.engine.stop().await;
}

#[tokio::test]
async fn lazy_peer_wakes_on_inbound_offer() {
    let h = Harness::start(lazy_config()).await;
    h.push_map(map(
        1,
        vec![peer(1, &["10.0.0.2/32"]), peer(2, &["10.0.0.3/32"])],
    ))
    .await;
    wait_for(
        || h.peer_status(&key(2)) == Some(ConnStatus::Idle),
        "peer 2 idle",
    )
    .await;

    h.push_signal(key(2), SignalBody::Offer(offer_payload())).await;

    // Peer 2 answers and starts connecting; peer 1 stays idle.
    wait_for(
        || h.signal_tx.count(&key(2), "answer") == 1,
        "answer to peer 2",
    )
    .await;
    wait_for(
        || !h.dialer.dials.lock().is_empty(),
        "dial attempt for peer 2",
    )
    .await;
    settle().await;
    assert_eq!(h.peer_status(&key(1)), Some(ConnStatus::Idle));
    assert_eq!(h.signal_tx.count(&key(1), "offer"), 0);

    h.engine.stop().await;
}

#[tokio::test]
async fn allowed_ip_change_recreates_session() {
    let h = Harness::start(eager_config()).await;
    h.dialer.set_mode(DialMode::Pend);
    h.push_map(map(1, vec![peer(1, &["10.0.0.2/32"])])).await;
    wait_for(
        || h.signal_tx.count(&key(1), "offer") == 1,
        "initial offer",
    )
    .await;

    h.push_map(map(2, vec![peer(1, &["10.0.0.2/32", "10.0.5.0/24"])]))
        .await;

    // The tunnel entry reflects the new set and a fresh session offers again.
    wait_for(
        || {
            h.tunnel.allowed_ips(&key(1))
                == Some(vec![
                    "10.0.0.2/32".parse().unwrap(),
                    "10.0.5.0/24".parse().unwrap(),
                ])
        },
        "updated tunnel allowed IPs",
    )
    .await;
    wait_for(
        || h.signal_tx.count(&key(1), "offer") >= 2,
        "re-offer after recreate",
    )
    .await;

    // Status continuity: the peer never disappeared from the ledger.
    let status = h.engine.status().get(&key(1)).expect("peer still present");
    assert_eq!(status.fqdn, "peer-1.mesh.example");

    h.engine.stop().await;
}

#[tokio::test]
async fn stale_map_is_ignored() {
    let h = Harness::start(eager_config()).await;
    h.dialer.set_mode(DialMode::Pend);
    h.push_map(map(1, vec![peer(1, &["10.0.0.2/32"])])).await;
    wait_for(|| h.peer_status(&key(1)).is_some(), "peer added").await;

    let routes_before = *h.routes.updates.lock();
    let firewall_before = *h.firewall.applies.lock();

    // Same serial again, now claiming an extra peer: must be a no-op.
    h.push_map(map(1, vec![peer(1, &["10.0.0.2/32"]), peer(2, &["10.0.0.3/32"])]))
        .await;
    settle().await;

    assert_eq!(h.peer_status(&key(2)), None);
    assert_eq!(*h.routes.updates.lock(), routes_before);
    assert_eq!(*h.firewall.applies.lock(), firewall_before);

    h.engine.stop().await;
}

#[tokio::test]
async fn admission_gate_bounds_first_handshakes() {
    let cfg = EngineConfig {
        admission_limit: 2,
        ..eager_config()
    };
    let h = Harness::start(cfg).await;
    h.dialer.set_mode(DialMode::Pend);

    let peers: Vec<PeerDescriptor> = (1..=5).map(|n| peer(n, &["10.0.0.2/32"])).collect();
    h.push_map(map(1, peers)).await;

    // Exactly two sessions get slots and send offers; three queue.
    wait_for(|| h.signal_tx.total("offer") == 2, "two initial offers").await;
    settle().await;
    assert_eq!(h.signal_tx.total("offer"), 2);

    // Complete one negotiation: answer whichever peer offered first.
    h.dialer.set_mode(DialMode::Succeed);
    let first_offered = h.signal_tx.sent.lock()[0].to;
    h.push_signal(first_offered, SignalBody::Answer(offer_payload()))
        .await;

    wait_for(
        || h.peer_status(&first_offered) == Some(ConnStatus::Connected),
        "first peer connected",
    )
    .await;

    // Its slot frees exactly one queued session.
    wait_for(|| h.signal_tx.total("offer") == 3, "third offer").await;
    settle().await;
    assert_eq!(h.signal_tx.total("offer"), 3);

    h.engine.stop().await;
}

#[tokio::test]
async fn explicitly_empty_map_removes_everything() {
    let h = Harness::start(eager_config()).await;
    h.dialer.set_mode(DialMode::Pend);
    h.push_map(map(1, vec![peer(1, &["10.0.0.2/32"]), peer(2, &["10.0.0.3/32"])]))
        .await;
    wait_for(|| h.tunnel.peers.lock().len() == 2, "two tunnel peers").await;

    // remote_peers_is_empty is set by the builder for an empty list.
    h.push_map(map(2, vec![])).await;

    wait_for(|| h.tunnel.peers.lock().is_empty(), "tunnel drained").await;
    assert_eq!(h.peer_status(&key(1)), None);
    assert_eq!(h.peer_status(&key(2)), None);

    h.engine.stop().await;
}

#[tokio::test]
async fn elided_peer_list_keeps_current_set() {
    let h = Harness::start(eager_config()).await;
    h.dialer.set_mode(DialMode::Pend);
    h.push_map(map(1, vec![peer(1, &["10.0.0.2/32"])])).await;
    wait_for(|| h.tunnel.peers.lock().len() == 1, "peer installed").await;

    // Empty list without the explicit marker: an elided field, not a purge.
    let mut next = map(2, vec![]);
    next.remote_peers_is_empty = false;
    h.push_map(next).await;
    settle().await;

    assert_eq!(h.tunnel.peers.lock().len(), 1);
    assert!(h.peer_status(&key(1)).is_some());

    h.engine.stop().await;
}

#[tokio::test]
async fn simultaneous_offers_tie_break_on_key_order() {
    // Local key is [100; 32]. Peer 200 outranks us (they stay initiator,
    // we convert); peer 1 does not (we ignore their offer).
    let h = Harness::start(eager_config()).await;
    h.dialer.set_mode(DialMode::Pend);
    h.push_map(map(1, vec![peer(200, &["10.0.0.2/32"]), peer(1, &["10.0.0.3/32"])]))
        .await;
    wait_for(|| h.signal_tx.total("offer") == 2, "both offers out").await;

    // Greater peer's offer converts us to responder.
    h.push_signal(key(200), SignalBody::Offer(offer_payload()))
        .await;
    wait_for(
        || h.signal_tx.count(&key(200), "answer") == 1,
        "answer to greater peer",
    )
    .await;

    // Lesser peer's offer is ignored; we keep waiting for their answer.
    h.push_signal(key(1), SignalBody::Offer(offer_payload())).await;
    settle().await;
    assert_eq!(h.signal_tx.count(&key(1), "answer"), 0);

    h.engine.stop().await;
}

#[tokio::test]
async fn transport_drop_triggers_reconnect() {
    let h = Harness::start(eager_config()).await;
    h.push_map(map(1, vec![peer(1, &["10.0.0.2/32"])])).await;
    wait_for(|| h.signal_tx.count(&key(1), "offer") == 1, "offer out").await;

    h.push_signal(key(1), SignalBody::Answer(offer_payload())).await;
    wait_for(
        || h.peer_status(&key(1)) == Some(ConnStatus::Connected),
        "connected",
    )
    .await;

    h.dialer.drop_transport(&key(1));

    // Reconnect: back to connecting and a fresh offer goes out.
    wait_for(
        || h.peer_status(&key(1)) == Some(ConnStatus::Connecting),
        "reconnecting",
    )
    .await;
    wait_for(
        || h.signal_tx.count(&key(1), "offer") >= 2,
        "reconnect offer",
    )
    .await;

    h.engine.stop().await;
}

#[tokio::test]
async fn failed_dial_retries_with_backoff() {
    let h = Harness::start(eager_config()).await;
    h.dialer.set_mode(DialMode::Fail);
    h.push_map(map(1, vec![peer(1, &["10.0.0.2/32"])])).await;
    wait_for(|| h.signal_tx.count(&key(1), "offer") == 1, "first offer").await;

    // Answering starts a dial that fails immediately; the session backs off
    // and retries with a fresh offer.
    h.push_signal(key(1), SignalBody::Answer(offer_payload())).await;
    wait_for(|| !h.dialer.dials.lock().is_empty(), "failed dial attempt").await;
    wait_for(
        || h.signal_tx.count(&key(1), "offer") >= 2,
        "retry offer after backoff",
    )
    .await;
    assert_eq!(h.peer_status(&key(1)), Some(ConnStatus::Connecting));

    h.engine.stop().await;
}

#[tokio::test]
async fn go_idle_quiesces_session() {
    let h = Harness::start(eager_config()).await;
    h.push_map(map(1, vec![peer(1, &["10.0.0.2/32"])])).await;
    wait_for(|| h.signal_tx.count(&key(1), "offer") == 1, "offer out").await;
    h.push_signal(key(1), SignalBody::Answer(offer_payload())).await;
    wait_for(
        || h.peer_status(&key(1)) == Some(ConnStatus::Connected),
        "connected",
    )
    .await;

    h.push_signal(key(1), SignalBody::GoIdle).await;

    wait_for(
        || h.peer_status(&key(1)) == Some(ConnStatus::Idle),
        "idle after GoIdle",
    )
    .await;
    // The tunnel entry survives quiesce; only the negotiation stops.
    assert!(h.tunnel.peers.lock().contains_key(&key(1)));

    h.engine.stop().await;
}

#[tokio::test]
async fn forwarding_targets_stay_eager_in_lazy_mode() {
    let h = Harness::start(lazy_config()).await;
    h.dialer.set_mode(DialMode::Pend);

    let mut m = map(1, vec![peer(1, &["10.0.0.2/32"]), peer(2, &["10.0.0.3/32"])]);
    m.forwarding_rules = vec![meshwire_proto::map::ForwardRule {
        protocol: "tcp".into(),
        ingress_port: 443,
        translated_peer: key(1),
        translated_port: 8443,
    }];
    h.push_map(m).await;

    // The forwarding target negotiates despite lazy mode; the other idles.
    wait_for(
        || h.signal_tx.count(&key(1), "offer") == 1,
        "forwarding target offers",
    )
    .await;
    settle().await;
    assert_eq!(h.peer_status(&key(2)), Some(ConnStatus::Idle));

    h.engine.stop().await;
}

#[tokio::test]
async fn wrongly_addressed_and_unknown_signals_are_dropped() {
    let h = Harness::start(eager_config()).await;
    h.dialer.set_mode(DialMode::Pend);
    h.push_map(map(1, vec![peer(1, &["10.0.0.2/32"])])).await;
    wait_for(|| h.peer_status(&key(1)).is_some(), "peer added").await;

    // Unknown sender: dropped.
    h.push_signal(key(77), SignalBody::Offer(offer_payload())).await;
    // Wrong recipient: dropped.
    h.signal_in
        .send(meshwire_proto::signal::SignalMessage {
            from: key(1),
            to: key(42),
            body: SignalBody::Answer(offer_payload()),
        })
        .await
        .unwrap();
    settle().await;

    assert_eq!(h.peer_status(&key(77)), None);
    assert_ne!(h.peer_status(&key(1)), Some(ConnStatus::Connected));

    h.engine.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent_and_reports_graceful() {
    let h = Harness::start(eager_config()).await;
    h.push_map(map(1, vec![peer(1, &["10.0.0.2/32"])])).await;
    wait_for(|| h.peer_status(&key(1)).is_some(), "peer added").await;

    h.engine.stop().await;
    h.engine.stop().await; // double stop is a no-op

    assert!(h.tunnel.peers.lock().is_empty());
    assert_eq!(h.engine.shutdown_reason().await, ShutdownReason::GracefulStop);
}

#[tokio::test]
async fn fatal_signal_stream_requests_reset() {
    let h = Harness::start(eager_config()).await;
    h.push_map(map(1, vec![])).await;

    // Dropping the inbound signal channel closes the stream fatally.
    drop(h.signal_in);

    assert_eq!(
        h.engine.shutdown_reason().await,
        ShutdownReason::ResetBySignal
    );
    h.engine.stop().await;
}

#[tokio::test]
async fn ssh_keys_follow_the_peer_set() {
    let cfg = EngineConfig {
        server_ssh_allowed: true,
        ..eager_config()
    };
    let h = Harness::start(cfg).await;
    h.dialer.set_mode(DialMode::Pend);

    let mut with_key = peer(1, &["10.0.0.2/32"]);
    with_key.ssh_public_key = Some("ssh-ed25519 AAAA...".into());
    h.push_map(map(1, vec![with_key, peer(2, &["10.0.0.3/32"])])).await;

    wait_for(
        || h.ssh.keys.lock().len() == 1,
        "one authorized key installed",
    )
    .await;
    assert_eq!(h.ssh.keys.lock()[0].0, key(1));

    // Removing the peer drops its key.
    h.push_map(map(2, vec![peer(2, &["10.0.0.3/32"])])).await;
    wait_for(|| h.ssh.keys.lock().is_empty(), "key removed with peer").await;

    h.engine.stop().await;
}

#[tokio::test]
async fn ha_group_announced_before_routes_apply() {
    let h = Harness::start(lazy_config()).await;
    h.dialer.set_mode(DialMode::Pend);

    let mut m = map(1, vec![peer(1, &["10.0.0.2/32"]), peer(2, &["10.0.0.3/32"])]);
    m.routes = vec![
        meshwire_proto::map::Route {
            id: "r1".into(),
            network: "10.200.0.0/16".into(),
            peer: key(1),
            metric: 100,
            masquerade: false,
            ha_group: Some("dc".into()),
        },
        meshwire_proto::map::Route {
            id: "r2".into(),
            network: "10.200.0.0/16".into(),
            peer: key(2),
            metric: 100,
            masquerade: false,
            ha_group: Some("dc".into()),
        },
    ];
    h.push_map(m).await;
    wait_for(|| *h.routes.updates.lock() >= 1, "routes applied").await;
    settle().await;
    assert_eq!(h.signal_tx.total("offer"), 0);

    // Traffic into the routed prefix wakes the whole HA group.
    h.engine.notice_traffic("10.200.4.4".parse().unwrap()).await;
    wait_for(
        || {
            let woken: HashSet<_> = h
                .signal_tx
                .sent
                .lock()
                .iter()
                .filter(|s| s.body.kind() == "offer")
                .map(|s| s.to)
                .collect();
            woken.contains(&key(1)) && woken.contains(&key(2))
        },
        "both HA members woken by traffic",
    )
    .await;

    h.engine.stop().await;
}
