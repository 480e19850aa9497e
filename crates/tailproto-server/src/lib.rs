//! TailProto server sessions.
//!
//! Wraps an existing event transport with per-connection key agreement,
//! envelope encryption, replay protection and key rotation:
//! - `manager`: connection registry and the inbound/outbound pipeline
//! - `keystore` / `rekey`: current + retired keys and the rotation state machine
//! - `engine` / `worker`: AEAD inline or on a bounded thread pool
//! - `transport`: traits the embedding server implements
//! - `peer` / `loopback`: client half and an in-process transport

pub mod clock;
pub mod engine;
pub mod error;
pub mod keystore;
pub mod loopback;
pub mod manager;
pub mod peer;
pub mod rekey;
pub mod session;
pub mod transport;
pub mod worker;

pub use error::SessionError;
pub use manager::SessionManager;
pub use peer::{PeerError, PeerSession};
pub use session::SessionInfo;
pub use transport::{ConnectionId, PeerChannel, RpcDispatcher};
