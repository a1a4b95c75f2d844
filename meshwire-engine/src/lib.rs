//! The peering engine of a mesh-VPN client.
//!
//! The engine consumes two long-lived streams (a control plane delivering
//! versioned network maps and a signal plane carrying per-peer negotiation
//! messages) and drives a tunnel interface plus a dynamic set of NAT
//! traversal sessions, one per remote peer.
//!
//! The embedding client implements the collaborator traits in [`collab`]
//! (tunnel device, firewall/route/DNS managers, key agreement, the two
//! streams, the ICE dialer) and hands them to [`engine::Engine::start`].
//! From there:
//!
//! - the control reader applies each network map under the engine's control
//!   mutex ([`reconcile`]),
//! - the signal router demultiplexes negotiation messages to per-peer
//!   session actors ([`router`], [`session`]),
//! - the connection manager decides which sessions negotiate eagerly and
//!   which wait for demand ([`conn`]),
//! - an admission gate caps concurrent first handshakes ([`admission`]).
//!
//! Engine shutdown publishes a [`error::ShutdownReason`]; the embedder
//! matches on it to distinguish a graceful stop from a reset that warrants
//! rebuilding the engine.

pub mod admission;
pub mod collab;
pub mod config;
pub mod conn;
pub mod engine;
pub mod error;
pub mod health;
pub mod ice;
pub mod reconcile;
pub mod router;
pub mod routes;
pub mod session;
pub mod statefile;
pub mod status;
pub mod store;

pub use config::EngineConfig;
pub use engine::{Collaborators, Engine};
pub use error::{EngineError, ShutdownReason};
pub use session::SessionState;
pub use status::{ConnStatus, EngineEvent};
