//! AEAD primitives for TailProto envelopes.
//!
//! A [`SessionKey`] holds 256 bits of HKDF output. Envelopes are sealed with
//! AES-256-GCM (default) or ChaCha20-Poly1305, a 96-bit IV drawn from the OS
//! CSPRNG for every encryption, and a 128-bit tag appended to the ciphertext.

use std::fmt;
use std::str::FromStr;

use aes_gcm::Aes256Gcm;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Symmetric key size in bytes.
pub const KEY_SIZE: usize = 32;

/// IV size for both supported AEADs.
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size appended to every ciphertext.
pub const TAG_SIZE: usize = 16;

/// Supported AEAD constructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CipherSuite {
    #[default]
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl CipherSuite {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Aes256Gcm => "aes-256-gcm",
            Self::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherSuite {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aes-256-gcm" | "aes256gcm" | "aes-gcm" => Ok(Self::Aes256Gcm),
            "chacha20-poly1305" | "chacha20poly1305" => Ok(Self::ChaCha20Poly1305),
            other => Err(CryptoError::UnsupportedCipher(other.to_string())),
        }
    }
}

/// Symmetric key material for one key version of a session.
///
/// The raw bytes never leave this crate except through [`seal`] and
/// [`open`]; they are zeroized on drop and redacted from `Debug`.
pub struct SessionKey {
    bytes: [u8; KEY_SIZE],
    key_id: String,
    version: u32,
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("key_id", &self.key_id)
            .field("version", &self.version)
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl SessionKey {
    /// Wrap raw key bytes. The caller should zeroize its own copy.
    pub const fn from_bytes(bytes: [u8; KEY_SIZE], key_id: String, version: u32) -> Self {
        Self {
            bytes,
            key_id,
            version,
        }
    }

    /// Build a key from a slice, checking its length.
    pub fn from_slice(bytes: &[u8], key_id: String, version: u32) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self::from_bytes(arr, key_id, version))
    }

    /// Opaque key identifier carried in the envelope `k` field.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Monotonic key version within a session.
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// Constant-time comparison of the key material.
    pub fn same_material(&self, other: &Self) -> bool {
        self.bytes.ct_eq(&other.bytes).into()
    }
}

/// Generate a fresh random IV.
pub fn random_iv() -> [u8; NONCE_SIZE] {
    let mut iv = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut iv);
    iv
}

fn check_iv(iv: &[u8]) -> Result<(), CryptoError> {
    if iv.len() == NONCE_SIZE {
        Ok(())
    } else {
        Err(CryptoError::InvalidNonceLength {
            expected: NONCE_SIZE,
            actual: iv.len(),
        })
    }
}

/// Encrypt `plaintext` under `key`, binding `aad`. Returns ciphertext || tag.
pub fn seal(
    suite: CipherSuite,
    key: &SessionKey,
    iv: &[u8],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    check_iv(iv)?;
    let nonce = GenericArray::from_slice(iv);
    let payload = Payload {
        msg: plaintext,
        aad,
    };
    match suite {
        CipherSuite::Aes256Gcm => Aes256Gcm::new_from_slice(&key.bytes)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?
            .encrypt(nonce, payload),
        CipherSuite::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(&key.bytes)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?
            .encrypt(nonce, payload),
    }
    .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
}

/// Decrypt and authenticate ciphertext || tag produced by [`seal`].
pub fn open(
    suite: CipherSuite,
    key: &SessionKey,
    iv: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    check_iv(iv)?;
    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::DecryptionFailed(format!(
            "ciphertext shorter than {TAG_SIZE}-byte tag"
        )));
    }
    let nonce = GenericArray::from_slice(iv);
    let payload = Payload {
        msg: ciphertext,
        aad,
    };
    match suite {
        CipherSuite::Aes256Gcm => Aes256Gcm::new_from_slice(&key.bytes)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?
            .decrypt(nonce, payload),
        CipherSuite::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(&key.bytes)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?
            .decrypt(nonce, payload),
    }
    .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

/// Create a random key for tests.
#[cfg(any(test, feature = "test-utils"))]
pub fn test_key(version: u32) -> SessionKey {
    let mut bytes = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut bytes);
    SessionKey::from_bytes(bytes, format!("test-{version}"), version)
}
