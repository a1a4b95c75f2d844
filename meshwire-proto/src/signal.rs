//! Signal-plane messages.
//!
//! The signal service relays small negotiation messages between peer pairs.
//! Messages are ordered per pair by the transport; the engine relies on that
//! for everything except candidates, which commute.
//!
//! ICE credentials ride inside offers and answers together with an
//! HMAC-SHA256 signature, so a receiver sharing a secret with the sender can
//! reject credentials injected by a compromised relay path.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::key::PeerKey;

type HmacSha256 = Hmac<Sha256>;

/// One message on the signal stream, addressed peer-to-peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMessage {
    pub from: PeerKey,
    pub to: PeerKey,
    pub body: SignalBody,
}

/// Message bodies. `Offer`/`Answer` carry the negotiation payload; a
/// `Candidate` carries one ICE candidate line; `GoIdle` asks the receiver to
/// quiesce the session (lazy mode); `Mode` is a legacy advisory kept for
/// compatibility with older peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalBody {
    #[serde(rename = "offer")]
    Offer(SessionPayload),
    #[serde(rename = "answer")]
    Answer(SessionPayload),
    #[serde(rename = "candidate")]
    Candidate { candidate: String },
    #[serde(rename = "mode")]
    Mode {
        #[serde(default)]
        direct: Option<bool>,
    },
    #[serde(rename = "go_idle")]
    GoIdle,
}

impl SignalBody {
    /// Wire name of the variant, for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalBody::Offer(_) => "offer",
            SignalBody::Answer(_) => "answer",
            SignalBody::Candidate { .. } => "candidate",
            SignalBody::Mode { .. } => "mode",
            SignalBody::GoIdle => "go_idle",
        }
    }
}

/// Negotiation payload shared by offers and answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPayload {
    /// ICE username fragment.
    pub ufrag: String,
    /// ICE password.
    pub pwd: String,
    /// Base64 HMAC-SHA256 over `ufrag:pwd` (see [`sign_credentials`]).
    /// Empty when the pair has no shared secret.
    #[serde(default)]
    pub credential_sig: String,
    /// Sender's data-plane listen port.
    #[serde(default)]
    pub wg_port: Option<u16>,
    /// Post-quantum public key, when the sender runs a key-agreement daemon.
    #[serde(default)]
    pub pq_key: Option<String>,
    /// Listen address of the sender's key-agreement daemon.
    #[serde(default)]
    pub pq_addr: Option<String>,
    /// Relay server the sender is reachable on, when it expects the direct
    /// and TURN paths to fail.
    #[serde(default)]
    pub relay_addr: Option<String>,
}

/// Sign `ufrag:pwd` with the pair's shared secret.
pub fn sign_credentials(secret: &[u8], ufrag: &str, pwd: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(ufrag.as_bytes());
    mac.update(b":");
    mac.update(pwd.as_bytes());
    B64.encode(mac.finalize().into_bytes())
}

/// Verify a credential signature. Constant-time on the MAC comparison.
pub fn verify_credentials(secret: &[u8], ufrag: &str, pwd: &str, sig: &str) -> bool {
    let Ok(raw) = B64.decode(sig) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(ufrag.as_bytes());
    mac.update(b":");
    mac.update(pwd.as_bytes());
    mac.verify_slice(&raw).is_ok()
}
