//! Seams to the surrounding event transport and RPC layer.
//!
//! TailProto never owns a socket. The embedding server implements
//! [`PeerChannel`] on top of its connection handling and [`RpcDispatcher`]
//! on top of its application handlers.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

/// Handshake request from the peer (plaintext).
pub const EVENT_INIT: &str = "crypt.init";
/// Server-initiated key rotation request (plaintext).
pub const EVENT_REKEY: &str = "crypt.rekey";
/// Encrypted single request/response.
pub const EVENT_INVOKE: &str = "tp.invoke";
/// Encrypted ordered batch.
pub const EVENT_BATCH: &str = "tp.batch";
/// Encrypted server push.
pub const EVENT_NOTIFY: &str = "notify";
/// Plaintext push announcing the rotation deadline.
pub const EVENT_REKEY_REQUIRED: &str = "notify:tailproto.rekey.required";

/// Identity of one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Errors surfaced by a [`PeerChannel`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,

    #[error("Peer did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Errors surfaced by an [`RpcDispatcher`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown event '{0}'")]
    UnknownEvent(String),

    #[error("Handler failed: {0}")]
    Failed(String),
}

/// Outbound half of a connection.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Fire-and-forget delivery of a named event.
    async fn emit(&self, conn: ConnectionId, event: &str, payload: Value)
    -> Result<(), TransportError>;

    /// Deliver a named event and wait for the correlated response.
    async fn request(
        &self,
        conn: ConnectionId,
        event: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError>;

    /// Close the connection. `reason` is a wire error code.
    async fn disconnect(&self, conn: ConnectionId, reason: &str);
}

/// Application-level handler for decrypted events.
#[async_trait]
pub trait RpcDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        conn: ConnectionId,
        event: &str,
        data: Value,
    ) -> Result<Value, DispatchError>;
}
