//! Wire-facing types shared between the meshwire peering engine and the
//! transport clients that feed it.
//!
//! Two long-lived streams drive the engine:
//!
//! - the **control plane** delivers [`control::SyncResponse`] frames carrying
//!   the authoritative [`map::NetworkMap`] plus relay/STUN/TURN config;
//! - the **signal plane** carries per-peer [`signal::SignalMessage`]s used to
//!   negotiate NAT traversal (offer/answer/candidate).
//!
//! Everything here is plain data: no sockets, no async. The engine crate
//! defines the traits the actual transports implement.

pub mod control;
pub mod key;
pub mod map;
pub mod signal;

pub use key::PeerKey;
pub use signal::{SignalBody, SignalMessage};
