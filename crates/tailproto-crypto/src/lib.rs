//! TailProto Crypto Library
//!
//! Key agreement and AEAD primitives for the TailProto secure channel.
//!
//! ## Crypto primitives
//!
//! - **Handshake**: P-256 ephemeral ECDH per handshake and per rekey → HKDF-SHA256 → 256-bit key
//! - **Encryption**: AES-256-GCM (default) or ChaCha20-Poly1305, random 96-bit IV, 128-bit tag

pub mod cipher;
pub mod error;
pub mod exchange;

#[cfg(any(test, feature = "test-utils"))]
pub use cipher::test_key;
pub use cipher::{CipherSuite, KEY_SIZE, NONCE_SIZE, SessionKey, TAG_SIZE, open, random_iv, seal};
pub use error::CryptoError;
#[cfg(any(test, feature = "test-utils"))]
pub use exchange::perform_key_exchange;
pub use exchange::{
    HandshakeOutput, KeyExchange, PUBLIC_KEY_LEN, decode_public_key, decode_public_key_b64,
    derive_session_key, encode_public_key_b64, handshake,
};
pub use p256::PublicKey;
