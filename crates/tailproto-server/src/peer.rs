//! Client half of the protocol.
//!
//! Used by the bench binary and the tests to talk to a [`SessionManager`]
//! the way a real peer would: it performs the handshake, seals requests with
//! its own sequence counter, opens replies and answers `crypt.rekey`.
//!
//! [`SessionManager`]: crate::manager::SessionManager

use std::sync::Arc;

use serde_json::{Value, json};
use tailproto_core::batch::{self, RpcEvent, RpcReply};
use tailproto_core::envelope::{self, Envelope, EnvelopeHeader};
use tailproto_core::ReplayGuard;
use tailproto_crypto::{
    CipherSuite, CryptoError, KeyExchange, SessionKey, decode_public_key_b64, open, random_iv,
    seal,
};

use crate::clock;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("Handshake has not completed")]
    NotEstablished,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The server answered with `{ result: false, error }`.
    #[error("Server declined: {0}")]
    Declined(String),

    #[error("No key for version {0}")]
    UnknownKeyVersion(u32),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Protocol(#[from] tailproto_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub struct PeerSession {
    suite: CipherSuite,
    pending_init: Option<KeyExchange>,
    current: Option<Arc<SessionKey>>,
    /// Kept to open server envelopes sealed just before a rotation.
    previous: Option<Arc<SessionKey>>,
    /// Rotated key not yet used for sending.
    staged: Option<SessionKey>,
    auto_adopt: bool,
    send_seq: u64,
    recv_window: ReplayGuard,
}

impl PeerSession {
    pub fn new(suite: CipherSuite) -> Self {
        Self {
            suite,
            pending_init: None,
            current: None,
            previous: None,
            staged: None,
            auto_adopt: true,
            send_seq: 0,
            recv_window: ReplayGuard::default(),
        }
    }

    /// Keep sending under the old key after answering `crypt.rekey` until
    /// [`adopt_staged`](Self::adopt_staged) is called.
    #[must_use]
    pub fn with_manual_rotation(mut self) -> Self {
        self.auto_adopt = false;
        self
    }

    pub fn key_version(&self) -> Option<u32> {
        self.current.as_ref().map(|k| k.version())
    }

    pub const fn send_seq(&self) -> u64 {
        self.send_seq
    }

    /// Start a handshake; returns the `crypt.init` payload.
    pub fn init_request(&mut self) -> Value {
        let exchange = KeyExchange::new();
        let payload = json!({ "clientPubKey": exchange.public_b64() });
        self.pending_init = Some(exchange);
        payload
    }

    /// Finish the handshake from the server's `crypt.init` response.
    pub fn complete(&mut self, response: &Value) -> Result<u32, PeerError> {
        let data = accepted(response)?;
        let exchange = self.pending_init.take().ok_or(PeerError::NotEstablished)?;
        let server_key = data
            .get("serverPubKey")
            .and_then(Value::as_str)
            .ok_or_else(|| PeerError::Handshake("missing serverPubKey".into()))?;
        let version = data
            .get("kv")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| PeerError::Handshake("missing kv".into()))?;
        let key = exchange.complete(&decode_public_key_b64(server_key)?, version)?;

        self.current = Some(Arc::new(key));
        self.previous = None;
        self.staged = None;
        self.send_seq = 0;
        self.recv_window.reset();
        Ok(version)
    }

    /// Seal raw plaintext into an envelope with the next sequence number.
    pub fn seal_raw(&mut self, plaintext: &[u8]) -> Result<Envelope, PeerError> {
        let key = self.current.as_ref().ok_or(PeerError::NotEstablished)?;
        self.send_seq += 1;
        let header = EnvelopeHeader {
            key_id: key.key_id().to_string(),
            seq: self.send_seq,
            key_version: key.version(),
        };
        let iv = random_iv();
        let aad = envelope::associated_data(header.key_version, header.seq);
        let ciphertext = seal(self.suite, key, &iv, &aad, plaintext)?;
        Ok(envelope::encode(&header, &iv, &ciphertext))
    }

    /// `tp.invoke` payload for one event.
    pub fn seal_event(&mut self, event: &RpcEvent) -> Result<Value, PeerError> {
        let plaintext = batch::pack_single(event)?;
        Ok(self.seal_raw(&plaintext)?.to_value())
    }

    /// `tp.batch` payload for an ordered list of events.
    pub fn seal_batch(&mut self, events: &[RpcEvent]) -> Result<Value, PeerError> {
        let plaintext = batch::pack(events)?;
        Ok(self.seal_raw(&plaintext)?.to_value())
    }

    /// Authenticate a server envelope and return its plaintext.
    pub fn open(&mut self, payload: &Value) -> Result<Vec<u8>, PeerError> {
        let decoded = envelope::decode(&Envelope::from_value(payload)?)?;
        let now = clock::now();
        self.recv_window.check(decoded.seq, now)?;
        let key = [
            self.current.as_deref(),
            self.previous.as_deref(),
            self.staged.as_ref(),
        ]
        .into_iter()
        .flatten()
        .find(|k| k.version() == decoded.key_version)
        .ok_or(PeerError::UnknownKeyVersion(decoded.key_version))?;
        let plaintext = open(
            self.suite,
            key,
            &decoded.iv,
            &decoded.associated_data(),
            &decoded.ciphertext,
        )?;
        self.recv_window.record(decoded.seq, now);
        Ok(plaintext)
    }

    /// Open the response to a `tp.invoke`.
    pub fn open_reply(&mut self, response: &Value) -> Result<RpcReply, PeerError> {
        let data = accepted(response)?;
        Ok(serde_json::from_slice(&self.open(data)?)?)
    }

    /// Open the response to a `tp.batch`.
    pub fn open_batch_reply(&mut self, response: &Value) -> Result<Vec<RpcReply>, PeerError> {
        let data = accepted(response)?;
        Ok(serde_json::from_slice(&self.open(data)?)?)
    }

    /// Open a server push (`notify` or `tp.batch`).
    pub fn open_push(&mut self, event: &str, payload: &Value) -> Result<Vec<RpcEvent>, PeerError> {
        let plaintext = self.open(payload)?;
        if event == crate::transport::EVENT_BATCH {
            Ok(batch::unpack(&plaintext, 0)?)
        } else {
            Ok(vec![batch::unpack_single(&plaintext)?])
        }
    }

    /// Answer a `crypt.rekey` request.
    pub fn handle_rekey_request(&mut self, payload: &Value) -> Result<Value, PeerError> {
        let current = self.key_version().ok_or(PeerError::NotEstablished)?;
        let server_key = payload
            .get("serverPubKey")
            .and_then(Value::as_str)
            .ok_or_else(|| PeerError::Handshake("missing serverPubKey".into()))?;
        let version = payload
            .get("kv")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| PeerError::Handshake("missing kv".into()))?;
        if Some(version) != current.checked_add(1) {
            return Err(PeerError::Handshake(format!(
                "rotation to {version} from {current}"
            )));
        }

        let exchange = KeyExchange::new();
        let client_key = exchange.public_b64();
        let key = exchange.complete(&decode_public_key_b64(server_key)?, version)?;
        self.staged = Some(key);
        if self.auto_adopt {
            self.adopt_staged();
        }
        Ok(json!({ "result": true, "data": { "clientPubKey": client_key } }))
    }

    /// Start sending under the staged key. Returns `false` if none is staged.
    pub fn adopt_staged(&mut self) -> bool {
        let Some(next) = self.staged.take() else {
            return false;
        };
        self.previous = self.current.replace(Arc::new(next));
        true
    }
}

fn accepted(response: &Value) -> Result<&Value, PeerError> {
    if response.get("result").and_then(Value::as_bool) == Some(true) {
        Ok(response.get("data").unwrap_or(&Value::Null))
    } else {
        let code = response
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        Err(PeerError::Declined(code.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tailproto_crypto::handshake;

    use super::*;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;

    /// Play the server side of `crypt.init` by hand.
    fn established() -> (PeerSession, SessionKey) {
        let mut peer = PeerSession::new(CipherSuite::Aes256Gcm);
        let request = peer.init_request();
        let client_key = STANDARD
            .decode(request["clientPubKey"].as_str().unwrap())
            .unwrap();
        let out = handshake(&client_key, 1).unwrap();
        let response = json!({
            "result": true,
            "data": { "serverPubKey": STANDARD.encode(&out.server_public_key), "kv": 1 },
        });
        assert_eq!(peer.complete(&response).unwrap(), 1);
        (peer, out.session_key)
    }

    #[test]
    fn sealed_event_opens_with_server_key() {
        let (mut peer, server_key) = established();
        let value = peer.seal_event(&RpcEvent::new("ping", Value::Null)).unwrap();
        let decoded = envelope::decode(&Envelope::from_value(&value).unwrap()).unwrap();
        assert_eq!(decoded.seq, 1);
        assert_eq!(decoded.key_version, 1);
        let plaintext = open(
            CipherSuite::Aes256Gcm,
            &server_key,
            &decoded.iv,
            &decoded.associated_data(),
            &decoded.ciphertext,
        )
        .unwrap();
        assert_eq!(batch::unpack_single(&plaintext).unwrap().name, "ping");
    }

    #[test]
    fn declined_handshake_is_reported() {
        let mut peer = PeerSession::new(CipherSuite::Aes256Gcm);
        peer.init_request();
        let err = peer
            .complete(&json!({ "result": false, "error": "tp_handshake" }))
            .unwrap_err();
        assert!(matches!(err, PeerError::Declined(code) if code == "tp_handshake"));
    }

    #[test]
    fn sealing_requires_handshake() {
        let mut peer = PeerSession::new(CipherSuite::Aes256Gcm);
        assert!(matches!(
            peer.seal_raw(b"x"),
            Err(PeerError::NotEstablished)
        ));
    }

    #[test]
    fn rekey_request_must_advance_version() {
        let (mut peer, _) = established();
        let server = KeyExchange::new();
        let bad = json!({ "serverPubKey": server.public_b64(), "kv": 3 });
        assert!(peer.handle_rekey_request(&bad).is_err());

        let good = json!({ "serverPubKey": server.public_b64(), "kv": 2 });
        let answer = peer.handle_rekey_request(&good).unwrap();
        assert_eq!(answer["result"], true);
        assert!(answer["data"]["clientPubKey"].is_string());
        assert_eq!(peer.key_version(), Some(2));
    }

    #[test]
    fn manual_rotation_stages_key() {
        let (peer, _) = established();
        let mut peer = peer.with_manual_rotation();
        let server = KeyExchange::new();
        peer.handle_rekey_request(&json!({ "serverPubKey": server.public_b64(), "kv": 2 }))
            .unwrap();
        assert_eq!(peer.key_version(), Some(1));
        assert!(peer.adopt_staged());
        assert_eq!(peer.key_version(), Some(2));
        assert!(!peer.adopt_staged());
    }
}
