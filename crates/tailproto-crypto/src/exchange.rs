//! Key exchange protocol logic.
//!
//! Each side generates an ephemeral P-256 keypair per handshake (and per
//! rekey), performs ECDH with the peer's public point, and expands the raw
//! shared secret with HKDF-SHA256 into a 256-bit AEAD key.

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::PublicKey;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::cipher::{KEY_SIZE, SessionKey};
use crate::error::CryptoError;

/// HKDF info string binding derived keys to this protocol.
const HKDF_INFO: &[u8] = b"tailproto-authkey";

/// HKDF info string for the public key-id hint.
const HKDF_KEY_ID_INFO: &[u8] = b"tailproto-keyid";

/// Fixed empty salt; both sides must agree on it.
const HKDF_SALT: &[u8] = &[];

/// Length of an uncompressed SEC1 P-256 point.
pub const PUBLIC_KEY_LEN: usize = 65;

/// Number of HKDF output bytes used for the key id.
const KEY_ID_LEN: usize = 8;

/// Decode a SEC1-encoded P-256 public key (compressed or uncompressed).
///
/// Off-curve points and the identity are rejected.
pub fn decode_public_key(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
    PublicKey::from_sec1_bytes(bytes).map_err(|_| {
        CryptoError::InvalidPublicKey(format!("not a P-256 point ({} bytes)", bytes.len()))
    })
}

/// Decode a base64 (standard alphabet) P-256 public key.
pub fn decode_public_key_b64(encoded: &str) -> Result<PublicKey, CryptoError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| CryptoError::InvalidPublicKey(format!("invalid base64: {e}")))?;
    decode_public_key(&bytes)
}

/// Encode a public key as base64 of its uncompressed SEC1 form.
pub fn encode_public_key_b64(key: &PublicKey) -> String {
    STANDARD.encode(key.to_encoded_point(false).as_bytes())
}

/// Expand an ECDH shared secret into a versioned [`SessionKey`].
pub fn derive_session_key(shared_secret: &[u8], version: u32) -> Result<SessionKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared_secret);

    let mut key = [0u8; KEY_SIZE];
    hk.expand(HKDF_INFO, &mut key)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

    let mut key_id = [0u8; KEY_ID_LEN];
    hk.expand(HKDF_KEY_ID_INFO, &mut key_id)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

    let session_key = SessionKey::from_bytes(key, URL_SAFE_NO_PAD.encode(key_id), version);
    key.zeroize();
    Ok(session_key)
}

/// One side of a key exchange in progress.
pub struct KeyExchange {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyExchange {
    /// Start a new key exchange by generating an ephemeral keypair.
    pub fn new() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Our ephemeral public key, uncompressed SEC1.
    pub fn public_bytes(&self) -> Vec<u8> {
        self.public.to_encoded_point(false).as_bytes().to_vec()
    }

    /// Our ephemeral public key as sent on the wire.
    pub fn public_b64(&self) -> String {
        encode_public_key_b64(&self.public)
    }

    /// Complete the exchange with the peer's public key and derive the key
    /// for `version`. Consumes the ephemeral secret.
    pub fn complete(self, peer_public: &PublicKey, version: u32) -> Result<SessionKey, CryptoError> {
        let shared = self.secret.diffie_hellman(peer_public);
        derive_session_key(shared.raw_secret_bytes().as_slice(), version)
    }
}

/// Result of the server half of a handshake.
#[derive(Debug)]
pub struct HandshakeOutput {
    /// Server ephemeral public key, uncompressed SEC1.
    pub server_public_key: Vec<u8>,
    /// Derived AEAD key.
    pub session_key: SessionKey,
    /// Version assigned to `session_key`.
    pub key_version: u32,
}

/// Run the server half of a handshake against a client's SEC1 public key.
pub fn handshake(
    client_public_key: &[u8],
    key_version: u32,
) -> Result<HandshakeOutput, CryptoError> {
    let peer = decode_public_key(client_public_key)?;
    let exchange = KeyExchange::new();
    let server_public_key = exchange.public_bytes();
    let session_key = exchange.complete(&peer, key_version)?;
    Ok(HandshakeOutput {
        server_public_key,
        session_key,
        key_version,
    })
}

/// Perform a complete exchange locally and return both sides' keys.
#[cfg(any(test, feature = "test-utils"))]
pub fn perform_key_exchange(version: u32) -> Result<(SessionKey, SessionKey), CryptoError> {
    let client = KeyExchange::new();
    let client_pub = client.public_bytes();

    let server = handshake(&client_pub, version)?;
    let server_pub = decode_public_key(&server.server_public_key)?;
    let client_key = client.complete(&server_pub, version)?;

    Ok((client_key, server.session_key))
}
