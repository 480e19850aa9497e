//! Wire envelope for encrypted TailProto payloads.
//!
//! The codec is purely structural: it maps the fixed envelope fields to and
//! from their JSON representation (binary fields base64-encoded) and never
//! touches key material.
//!
//! ```text
//! { "v": 2, "k": <keyId>, "s": <seq>, "kv": <keyVersion>, "iv": <b64>, "d": <b64> }
//! ```

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tailproto_crypto::{NONCE_SIZE, TAG_SIZE};

use crate::error::{Error, Result};

/// The only envelope version this implementation accepts and emits.
pub const PROTOCOL_VERSION: u64 = 2;

/// Domain tag prefixed to the associated data of every envelope.
const AAD_TAG: &[u8] = b"tailproto/v2";

/// An envelope as exchanged on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "v")]
    pub version: u64,
    #[serde(rename = "k")]
    pub key_id: String,
    #[serde(rename = "s")]
    pub seq: u64,
    #[serde(rename = "kv")]
    pub key_version: u32,
    pub iv: String,
    #[serde(rename = "d")]
    pub data: String,
}

/// Sender-side metadata for a new envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub key_id: String,
    pub seq: u64,
    pub key_version: u32,
}

/// A validated envelope with binary fields decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEnvelope {
    pub key_id: String,
    pub seq: u64,
    pub key_version: u32,
    pub iv: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

impl DecodedEnvelope {
    /// Associated data that the sender bound into the ciphertext.
    pub fn associated_data(&self) -> Vec<u8> {
        associated_data(self.key_version, self.seq)
    }
}

/// Build the AEAD associated data for an envelope header.
///
/// Binding the version, key version and sequence number means a captured
/// envelope cannot be replayed under a different `s` or `kv`.
pub fn associated_data(key_version: u32, seq: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(AAD_TAG.len() + 12);
    aad.extend_from_slice(AAD_TAG);
    aad.extend_from_slice(&key_version.to_be_bytes());
    aad.extend_from_slice(&seq.to_be_bytes());
    aad
}

/// Assemble an envelope from a header, IV and ciphertext (tag included).
pub fn encode(header: &EnvelopeHeader, iv: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Envelope {
    Envelope {
        version: PROTOCOL_VERSION,
        key_id: header.key_id.clone(),
        seq: header.seq,
        key_version: header.key_version,
        iv: STANDARD.encode(iv),
        data: STANDARD.encode(ciphertext),
    }
}

/// Validate an envelope and decode its binary fields.
pub fn decode(envelope: &Envelope) -> Result<DecodedEnvelope> {
    if envelope.version != PROTOCOL_VERSION {
        return Err(Error::UnsupportedVersion(envelope.version));
    }

    let iv_bytes = STANDARD
        .decode(&envelope.iv)
        .map_err(|e| Error::Envelope(format!("iv is not base64: {e}")))?;
    let iv: [u8; NONCE_SIZE] = iv_bytes.as_slice().try_into().map_err(|_| {
        Error::Envelope(format!(
            "iv must be {NONCE_SIZE} bytes, got {}",
            iv_bytes.len()
        ))
    })?;

    let ciphertext = STANDARD
        .decode(&envelope.data)
        .map_err(|e| Error::Envelope(format!("data is not base64: {e}")))?;
    if ciphertext.len() < TAG_SIZE {
        return Err(Error::Envelope(format!(
            "data shorter than the {TAG_SIZE}-byte tag"
        )));
    }

    Ok(DecodedEnvelope {
        key_id: envelope.key_id.clone(),
        seq: envelope.seq,
        key_version: envelope.key_version,
        iv,
        ciphertext,
    })
}

impl Envelope {
    /// Parse an envelope out of an event payload.
    ///
    /// The version is checked before the remaining fields so that a future
    /// envelope format is reported as unsupported rather than malformed.
    pub fn from_value(value: &Value) -> Result<Self> {
        let Some(obj) = value.as_object() else {
            return Err(Error::Envelope("payload is not an object".into()));
        };
        match obj.get("v").and_then(Value::as_u64) {
            Some(PROTOCOL_VERSION) => {}
            Some(other) => return Err(Error::UnsupportedVersion(other)),
            None => return Err(Error::Envelope("missing or non-integer 'v'".into())),
        }
        serde_json::from_value(value.clone()).map_err(|e| Error::Envelope(e.to_string()))
    }

    /// Serialize to the JSON payload carried by the transport.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "v": self.version,
            "k": self.key_id,
            "s": self.seq,
            "kv": self.key_version,
            "iv": self.iv,
            "d": self.data,
        })
    }
}
