//! Session-level error types.
//!
//! Every variant maps onto a stable wire code sent back to the peer in a
//! plaintext decline `{ result: false, error: <code> }`.

use crate::transport::{DispatchError, TransportError};
use crate::worker::PoolError;

/// Errors raised while establishing or using a TailProto session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Bad or missing peer public key, or a refused key exchange.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Sequence number {seq} rejected by the replay window")]
    Replay { seq: u64 },

    /// The retired key is past its hit or time budget, or already gone.
    #[error("Key version {key_version} has expired")]
    KeyExpired { key_version: u32 },

    /// Peer used a key version the server never issued.
    #[error("Unknown key version {key_version}")]
    UnknownKeyVersion { key_version: u32 },

    #[error("Envelope failed authentication")]
    Decrypt,

    /// Peer did not adopt the rotated key before the deadline.
    #[error("Peer missed the rotation deadline for key version {key_version}")]
    RekeyTimeout { key_version: u32 },

    #[error("Malformed envelope: {0}")]
    Envelope(String),

    #[error("Invalid batch: {0}")]
    Batch(String),

    #[error("No TailProto session for this connection")]
    NoSession,

    #[error("Plaintext event '{0}' rejected")]
    PlaintextRejected(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Crypto worker error: {0}")]
    Worker(#[from] PoolError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Stable identifier carried in declines.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "tp_handshake",
            Self::Replay { .. } => "tp_replay",
            Self::KeyExpired { .. } | Self::RekeyTimeout { .. } => "tp_key_expired",
            Self::UnknownKeyVersion { .. } => "tp_key_version",
            Self::Decrypt => "tp_decrypt",
            Self::Envelope(_) => "tp_envelope",
            Self::Batch(_) => "tp_batch",
            Self::NoSession => "tp_no_session",
            Self::PlaintextRejected(_) => "tp_plaintext_rejected",
            Self::Transport(_) | Self::Dispatch(_) | Self::Worker(_) | Self::Internal(_) => {
                "tp_internal"
            }
        }
    }

    /// Whether the error ends the session rather than a single envelope.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::RekeyTimeout { .. })
    }
}

impl From<tailproto_core::Error> for SessionError {
    fn from(err: tailproto_core::Error) -> Self {
        use tailproto_core::Error;
        match err {
            Error::Envelope(msg) => Self::Envelope(msg),
            Error::UnsupportedVersion(v) => Self::Envelope(format!("unsupported version {v}")),
            Error::Replay { seq } => Self::Replay { seq },
            Error::Batch(msg) => Self::Batch(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(SessionError::Replay { seq: 1 }.code(), "tp_replay");
        assert_eq!(SessionError::Decrypt.code(), "tp_decrypt");
        assert_eq!(
            SessionError::UnknownKeyVersion { key_version: 9 }.code(),
            "tp_key_version"
        );
        assert_eq!(SessionError::NoSession.code(), "tp_no_session");
        assert_eq!(
            SessionError::Transport(TransportError::Closed).code(),
            "tp_internal"
        );
    }

    #[test]
    fn only_rekey_timeout_is_fatal() {
        assert!(SessionError::RekeyTimeout { key_version: 2 }.is_fatal());
        assert!(!SessionError::KeyExpired { key_version: 1 }.is_fatal());
        assert!(!SessionError::Decrypt.is_fatal());
    }

    #[test]
    fn core_errors_map_to_wire_codes() {
        let err: SessionError = tailproto_core::Error::UnsupportedVersion(3).into();
        assert_eq!(err.code(), "tp_envelope");
        let err: SessionError = tailproto_core::Error::Batch("too big".into()).into();
        assert_eq!(err.code(), "tp_batch");
        let err: SessionError = tailproto_core::Error::Replay { seq: 4 }.into();
        assert!(matches!(err, SessionError::Replay { seq: 4 }));
    }
}
