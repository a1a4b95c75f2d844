//! Engine error types and shutdown reasons.

use meshwire_proto::PeerKey;

/// Why the engine stopped. Published on a watch channel so the embedding
/// client can match on the reason and decide whether to rebuild the engine
/// (resets) or exit (graceful stop).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// `stop()` was called.
    GracefulStop,
    /// The control stream returned a terminal error.
    ResetByControl,
    /// The signal stream returned a terminal error.
    ResetBySignal,
    /// The host network changed and `network_monitor` is enabled.
    ResetByNetworkChange,
}

/// Errors surfaced by the engine to its embedder.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine is not started")]
    NotStarted,

    #[error("tunnel interface is not initialized")]
    TunnelNotInitialized,

    #[error("tunnel operation failed: {0}")]
    Tunnel(String),

    #[error("DNS manager failed to initialize: {0}")]
    DnsInit(String),

    #[error("manager operation failed: {0}")]
    Manager(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
}

/// Configuration parse failures. These reject the offending option wholesale
/// rather than applying a partial value.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid NAT external IP mapping {entry:?}: {reason}")]
    NatMapping { entry: String, reason: String },

    #[error("invalid overlay address {0:?}")]
    Address(String),
}

/// Errors from the control/signal transports. `Closed` and `Fatal` terminate
/// the reader and trigger an engine reset; `Transport` is retried by the
/// stream implementation itself and only reported for logging.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream closed")]
    Closed,

    #[error("fatal stream error: {0}")]
    Fatal(String),

    #[error("transient transport error: {0}")]
    Transport(String),
}

impl StreamError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StreamError::Closed | StreamError::Fatal(_))
    }
}

/// Errors from a transport dial attempt. All of these are session-scoped:
/// the session retries with backoff and never propagates them upward.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("ICE gathering failed: {0}")]
    Gathering(String),

    #[error("no reachable path to peer: {0}")]
    Unreachable(String),

    #[error("relay rejected our token: {0}")]
    RelayAuth(String),

    #[error("dial cancelled")]
    Cancelled,
}

/// One skipped entry while applying a network map. The reconciler aggregates
/// these, logs them, and keeps applying the rest of the map.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("peer {peer}: invalid allowed IP {entry:?}: {reason}")]
    AllowedIp {
        peer: PeerKey,
        entry: String,
        reason: String,
    },

    #[error("route {id}: invalid network {entry:?}: {reason}")]
    RouteNetwork {
        id: String,
        entry: String,
        reason: String,
    },

    #[error("forwarding rule on port {port}: unknown protocol {protocol:?}")]
    ForwardProtocol { protocol: String, port: u16 },

    #[error("invalid STUN/TURN URI {uri:?}: {reason}")]
    IceUri { uri: String, reason: String },

    #[error("{manager} update failed: {reason}")]
    Manager {
        manager: &'static str,
        reason: String,
    },
}
