//! Peer identity keys.

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Opaque 32-byte public identifier of a remote peer.
///
/// Keys are immutable and unique per peer; the engine indexes everything by
/// them. The wire representation is standard base64 (44 chars), which is also
/// the `Display` form. Ordering is lexicographic on the raw bytes; the
/// offer/offer tie-break relies on it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey([u8; 32]);

impl PeerKey {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short prefix of the base64 form, for log lines.
    pub fn short(&self) -> String {
        let full = B64.encode(self.0);
        full[..8.min(full.len())].to_string()
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&B64.encode(self.0))
    }
}

impl fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerKey({})", self.short())
    }
}

/// Error parsing a peer key from its base64 form.
#[derive(Debug, thiserror::Error)]
#[error("invalid peer key: {0}")]
pub struct InvalidKey(String);

impl FromStr for PeerKey {
    type Err = InvalidKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = B64
            .decode(s)
            .map_err(|e| InvalidKey(format!("bad base64: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| InvalidKey(format!("expected 32 bytes, got {}", v.len())))?;
        Ok(Self(bytes))
    }
}

impl Serialize for PeerKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_base64() {
        let key = PeerKey::from_bytes([7u8; 32]);
        let text = key.to_string();
        assert_eq!(text.parse::<PeerKey>().unwrap(), key);
    }

    #[test]
    fn rejects_wrong_length() {
        let short = B64.encode([1u8; 16]);
        assert!(short.parse::<PeerKey>().is_err());
        assert!("not base64 !!!".parse::<PeerKey>().is_err());
    }

    #[test]
    fn ordering_is_byte_lexicographic() {
        let lo = PeerKey::from_bytes([0u8; 32]);
        let mut hi_bytes = [0u8; 32];
        hi_bytes[0] = 1;
        let hi = PeerKey::from_bytes(hi_bytes);
        assert!(lo < hi);
    }

    #[test]
    fn serde_uses_string_form() {
        let key = PeerKey::from_bytes([42u8; 32]);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{key}\""));
        let back: PeerKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
