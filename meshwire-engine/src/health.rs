//! On-demand health probing.
//!
//! Combines the stream reader health bits with live reachability probes of
//! every STUN/TURN server in the current snapshot and a per-peer stats sweep
//! from the tunnel. Network probes run outside the control mutex; only the
//! stats sweep holds it.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::RngCore;
use tokio::net::UdpSocket;

use crate::engine::EngineShared;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// STUN binding request/response message types (RFC 5389).
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const MAGIC_COOKIE: u32 = 0x2112_A442;

#[derive(Debug, Clone)]
pub struct ServerProbe {
    pub uri: String,
    pub reachable: bool,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub control_healthy: bool,
    pub signal_healthy: bool,
    pub servers: Vec<ServerProbe>,
    /// Aggregate: both streams healthy and, when any traversal server is
    /// configured, at least one reachable.
    pub healthy: bool,
}

pub(crate) async fn probe(shared: &Arc<EngineShared>) -> HealthReport {
    let control_healthy = shared.stream_health.control.load(Ordering::Relaxed);
    let signal_healthy = shared.stream_health.signal.load(Ordering::Relaxed);

    // Snapshot once; probing must not block list swaps or reconciliation.
    let snapshot = shared.ice.snapshot();
    let mut servers = Vec::with_capacity(snapshot.stuns.len() + snapshot.turns.len());
    for stun in &snapshot.stuns {
        servers.push(ServerProbe {
            uri: format!("stun:{}:{}", stun.host, stun.port),
            reachable: probe_binding(&stun.host, stun.port).await,
        });
    }
    for turn in &snapshot.turns {
        // TURN servers answer plain binding requests too; reachability is
        // all we assert here, not allocation credentials.
        servers.push(ServerProbe {
            uri: format!("turn:{}:{}", turn.host, turn.port),
            reachable: probe_binding(&turn.host, turn.port).await,
        });
    }

    // Stats sweep is quick and touches shared peer state: mutex-scoped.
    {
        let _guard = shared.control.lock().await;
        for key in shared.store.keys() {
            if let Some(stats) = shared.ops.tunnel.peer_stats(&key).await {
                shared.status.set_transfer(&key, stats);
            }
        }
    }

    let servers_ok = servers.is_empty() || servers.iter().any(|s| s.reachable);
    HealthReport {
        control_healthy,
        signal_healthy,
        healthy: control_healthy && signal_healthy && servers_ok,
        servers,
    }
}

/// Send one STUN binding request and wait briefly for a success response
/// with a matching transaction ID.
async fn probe_binding(host: &str, port: u16) -> bool {
    let Ok(socket) = UdpSocket::bind("0.0.0.0:0").await else {
        return false;
    };
    if socket.connect((host, port)).await.is_err() {
        return false;
    }

    let mut request = [0u8; 20];
    request[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // length stays zero: no attributes
    request[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    let mut txid = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut txid);
    request[8..20].copy_from_slice(&txid);

    if socket.send(&request).await.is_err() {
        return false;
    }

    let mut response = [0u8; 548];
    let received = tokio::time::timeout(PROBE_TIMEOUT, socket.recv(&mut response)).await;
    match received {
        Ok(Ok(n)) if n >= 20 => {
            let msg_type = u16::from_be_bytes([response[0], response[1]]);
            msg_type == BINDING_SUCCESS && response[8..20] == txid
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binding_probe_round_trips_against_local_responder() {
        // Minimal STUN responder: echo a binding success with the request's
        // transaction ID.
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 548];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            assert!(n >= 20);
            let mut reply = [0u8; 20];
            reply[0..2].copy_from_slice(&BINDING_SUCCESS.to_be_bytes());
            reply[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            reply[8..20].copy_from_slice(&buf[8..20]);
            server.send_to(&reply, from).await.unwrap();
        });

        assert!(probe_binding("127.0.0.1", addr.port()).await);
    }

    #[tokio::test]
    async fn binding_probe_times_out_on_silence() {
        // Bound but never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        tokio::time::pause();
        let probe = tokio::spawn(async move { probe_binding("127.0.0.1", addr.port()).await });
        tokio::time::advance(PROBE_TIMEOUT + Duration::from_millis(100)).await;
        assert!(!probe.await.unwrap());
        drop(silent);
    }
}
