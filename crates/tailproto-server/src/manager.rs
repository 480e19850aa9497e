//! Connection-keyed session registry and the inbound/outbound pipeline.
//!
//! Inbound: decode → replay check → key selection → decrypt → replay record
//! → rotation commit, all under the session lock; the lock is released
//! before the decrypted events are dispatched. Each session also owns a
//! background task that drives key rotation and enforces its deadline.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use tailproto_core::batch::{self, RpcEvent, RpcReply};
use tailproto_core::config::TailProtoConfig;
use tailproto_core::envelope::{self, Envelope, EnvelopeHeader};
use tailproto_core::metrics::{Counter, Histogram, MetricsRecorder};
use tailproto_crypto::{KeyExchange, PublicKey, decode_public_key_b64, random_iv};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock;
use crate::engine::CryptoEngine;
use crate::error::SessionError;
use crate::keystore::KeySlot;
use crate::session::{Session, SessionHandle, SessionInfo};
use crate::transport::{
    ConnectionId, EVENT_BATCH, EVENT_INIT, EVENT_INVOKE, EVENT_NOTIFY, EVENT_REKEY,
    EVENT_REKEY_REQUIRED, PeerChannel, RpcDispatcher,
};

/// Build the plaintext decline for `err`.
pub fn decline(err: &SessionError) -> Value {
    json!({ "result": false, "error": err.code() })
}

fn accept(data: Value) -> Value {
    json!({ "result": true, "data": data })
}

/// Owns every session of one server. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: TailProtoConfig,
    channel: Arc<dyn PeerChannel>,
    dispatcher: Arc<dyn RpcDispatcher>,
    metrics: Arc<dyn MetricsRecorder>,
    engine: CryptoEngine,
    sessions: RwLock<HashMap<ConnectionId, Arc<SessionHandle>>>,
}

impl SessionManager {
    pub fn new(
        config: TailProtoConfig,
        channel: Arc<dyn PeerChannel>,
        dispatcher: Arc<dyn RpcDispatcher>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let engine = CryptoEngine::new(&config, Arc::clone(&metrics))?;
        info!(
            enabled = config.enabled,
            required = config.required,
            cipher = %config.cipher,
            "TailProto session manager ready"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                channel,
                dispatcher,
                metrics,
                engine,
                sessions: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &TailProtoConfig {
        &self.inner.config
    }

    pub fn engine(&self) -> &CryptoEngine {
        &self.inner.engine
    }

    /// Handle one inbound frame and produce the response for the caller.
    ///
    /// Never fails: protocol errors become plaintext declines.
    pub async fn handle_inbound(&self, conn: ConnectionId, event: &str, payload: Value) -> Value {
        let inner = &self.inner;
        if !inner.config.enabled {
            return inner.passthrough(conn, event, payload).await;
        }
        let result = match event {
            EVENT_INIT => self.handle_init(conn, &payload).await,
            EVENT_INVOKE => inner.handle_invoke(conn, &payload).await,
            EVENT_BATCH => inner.handle_batch(conn, &payload).await,
            _ => return inner.handle_plaintext(conn, event, payload).await,
        };
        result.unwrap_or_else(|e| {
            debug!(connection_id = %conn, event, error = %e, "Declined inbound event");
            decline(&e)
        })
    }

    async fn handle_init(&self, conn: ConnectionId, payload: &Value) -> Result<Value, SessionError> {
        let inner = &self.inner;
        let output = payload
            .get("clientPubKey")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::Handshake("missing clientPubKey".into()))
            .and_then(|encoded| {
                STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| SessionError::Handshake(format!("clientPubKey: {e}")))
            })
            .and_then(|bytes| {
                tailproto_crypto::handshake(&bytes, 1)
                    .map_err(|e| SessionError::Handshake(e.to_string()))
            });
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                inner.metrics.increment(Counter::HandshakeFailed);
                warn!(connection_id = %conn, error = %e, "Handshake failed");
                return Err(e);
            }
        };

        let session = Session::new(conn, output.session_key, &inner.config, clock::now());
        let handle = Arc::new(SessionHandle::new(session));
        let previous = inner
            .sessions
            .write()
            .await
            .insert(conn, Arc::clone(&handle));
        if let Some(previous) = previous {
            previous.close();
            debug!(connection_id = %conn, session_id = %previous.session_id(), "Replaced session");
        }
        let _rekey_task = spawn_rekey_task(Arc::downgrade(&self.inner), conn, handle.clone());

        inner.metrics.increment(Counter::HandshakeCompleted);
        info!(
            connection_id = %conn,
            session_id = %handle.session_id(),
            "TailProto session established"
        );
        Ok(accept(json!({
            "serverPubKey": STANDARD.encode(&output.server_public_key),
            "kv": output.key_version,
        })))
    }

    /// Push an application event to the peer, encrypted unless whitelisted.
    pub async fn send(&self, conn: ConnectionId, event: &str, data: Value) -> Result<(), SessionError> {
        let inner = &self.inner;
        if !inner.config.enabled || inner.config.is_whitelisted(event) {
            return Ok(inner.channel.emit(conn, event, data).await?);
        }
        let Some(handle) = inner.session(conn).await else {
            if inner.config.required {
                return Err(SessionError::NoSession);
            }
            return Ok(inner.channel.emit(conn, event, data).await?);
        };
        let plaintext = batch::pack_single(&RpcEvent::new(event, data))?;
        let envelope = inner.seal(&handle, plaintext).await?;
        Ok(inner
            .channel
            .emit(conn, EVENT_NOTIFY, envelope.to_value())
            .await?)
    }

    /// Push several events in one encrypted `tp.batch` envelope.
    pub async fn send_batch(
        &self,
        conn: ConnectionId,
        events: &[RpcEvent],
    ) -> Result<(), SessionError> {
        let inner = &self.inner;
        let handle = inner.session(conn).await.ok_or(SessionError::NoSession)?;
        let plaintext = batch::pack(events)?;
        let envelope = inner.seal(&handle, plaintext).await?;
        Ok(inner
            .channel
            .emit(conn, EVENT_BATCH, envelope.to_value())
            .await?)
    }

    /// Rotate the session key now instead of waiting for the interval.
    ///
    /// Returns `Ok(false)` when a rotation is already in progress.
    pub async fn force_rekey(&self, conn: ConnectionId) -> Result<bool, SessionError> {
        let inner = &self.inner;
        let handle = inner.session(conn).await.ok_or(SessionError::NoSession)?;
        let next = {
            let now = clock::now();
            let mut session = handle.session.lock().await;
            if !session.rekey.begin(now, true) {
                return Ok(false);
            }
            match next_version(&session) {
                Ok(next) => next,
                Err(e) => {
                    session.rekey.abort(now);
                    return Err(e);
                }
            }
        };
        inner.rotate(conn, &handle, next, true).await?;
        Ok(true)
    }

    /// Server-initiated close with `reason` as the wire code.
    pub async fn disconnect(&self, conn: ConnectionId, reason: &SessionError) {
        let handle = self.inner.sessions.write().await.remove(&conn);
        if let Some(handle) = handle {
            handle.close();
        }
        info!(connection_id = %conn, reason = reason.code(), "Disconnecting peer");
        self.inner.channel.disconnect(conn, reason.code()).await;
    }

    /// The transport reports the connection gone; drop its session.
    pub async fn connection_closed(&self, conn: ConnectionId) {
        if let Some(handle) = self.inner.sessions.write().await.remove(&conn) {
            handle.close();
            debug!(connection_id = %conn, "Session removed");
        }
    }

    pub async fn session_info(&self, conn: ConnectionId) -> Option<SessionInfo> {
        let handle = self.inner.session(conn).await?;
        Some(handle.info().await)
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Close every session.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.inner.sessions.write().await.drain().collect();
        for (conn, handle) in drained {
            handle.close();
            debug!(connection_id = %conn, "Session closed on shutdown");
        }
    }
}

fn next_version(session: &Session) -> Result<u32, SessionError> {
    session
        .keys
        .current_version()
        .checked_add(1)
        .ok_or_else(|| SessionError::Internal("key version space exhausted".into()))
}

impl Inner {
    async fn session(&self, conn: ConnectionId) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(&conn).cloned()
    }

    /// Remove `handle` from the registry unless it was already replaced.
    async fn remove_if_current(&self, conn: ConnectionId, handle: &Arc<SessionHandle>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&conn) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                sessions.remove(&conn);
                true
            }
            _ => false,
        }
    }

    async fn teardown(&self, conn: ConnectionId, handle: &Arc<SessionHandle>, reason: &SessionError) {
        handle.close();
        if self.remove_if_current(conn, handle).await {
            info!(connection_id = %conn, reason = reason.code(), "Disconnecting peer");
            self.channel.disconnect(conn, reason.code()).await;
        }
    }

    async fn passthrough(&self, conn: ConnectionId, event: &str, payload: Value) -> Value {
        match self.dispatcher.dispatch(conn, event, payload).await {
            Ok(data) => accept(data),
            Err(e) => {
                warn!(connection_id = %conn, event, error = %e, "Plaintext dispatch failed");
                json!({ "result": false, "error": e.to_string() })
            }
        }
    }

    async fn handle_plaintext(&self, conn: ConnectionId, event: &str, payload: Value) -> Value {
        let has_session = self.sessions.read().await.contains_key(&conn);
        if self.config.is_whitelisted(event) {
            if has_session {
                self.metrics.increment(Counter::PlaintextFallback);
                debug!(connection_id = %conn, event, "Whitelisted plaintext on secured connection");
            }
            return self.passthrough(conn, event, payload).await;
        }
        if self.config.required || has_session {
            self.metrics.increment(Counter::PlaintextRejected);
            warn!(connection_id = %conn, event, "Rejected plaintext event");
            return decline(&SessionError::PlaintextRejected(event.to_string()));
        }
        self.passthrough(conn, event, payload).await
    }

    async fn handle_invoke(&self, conn: ConnectionId, payload: &Value) -> Result<Value, SessionError> {
        let (handle, plaintext) = self.open(conn, payload).await?;
        let event = batch::unpack_single(&plaintext)
            .map_err(|e| SessionError::Envelope(e.to_string()))?;
        let reply = self.dispatch_one(conn, event).await;
        let envelope = self.seal(&handle, serde_json::to_vec(&reply).map_err(json_err)?).await?;
        Ok(accept(envelope.to_value()))
    }

    async fn handle_batch(&self, conn: ConnectionId, payload: &Value) -> Result<Value, SessionError> {
        let (handle, plaintext) = self.open(conn, payload).await?;
        let events = batch::unpack(&plaintext, self.config.max_batch_events)?;
        self.metrics.record(
            Histogram::BatchSize,
            u64::try_from(events.len()).unwrap_or(u64::MAX),
        );

        let mut replies = Vec::with_capacity(events.len());
        for event in events {
            replies.push(self.dispatch_one(conn, event).await);
        }
        let envelope = self
            .seal(&handle, serde_json::to_vec(&replies).map_err(json_err)?)
            .await?;
        Ok(accept(envelope.to_value()))
    }

    async fn dispatch_one(&self, conn: ConnectionId, event: RpcEvent) -> RpcReply {
        match self.dispatcher.dispatch(conn, &event.name, event.data).await {
            Ok(data) => RpcReply::ok(event.name, data),
            Err(e) => {
                warn!(connection_id = %conn, event = %event.name, error = %e, "Dispatch failed");
                RpcReply::err(event.name, e.to_string())
            }
        }
    }

    /// Authenticate an inbound envelope and return its plaintext.
    async fn open(
        &self,
        conn: ConnectionId,
        payload: &Value,
    ) -> Result<(Arc<SessionHandle>, Vec<u8>), SessionError> {
        let handle = self.session(conn).await.ok_or(SessionError::NoSession)?;
        let decoded = Envelope::from_value(payload)
            .and_then(|envelope| envelope::decode(&envelope))
            .map_err(|e| {
                self.metrics.increment(Counter::EnvelopeRejected);
                SessionError::from(e)
            })?;

        let mut session = handle.session.lock().await;
        let now = clock::now();
        if session.recv_window.check(decoded.seq, now).is_err() {
            self.metrics.increment(Counter::ReplayRejected);
            session.replay_rejections = session.replay_rejections.saturating_add(1);
            let rejections = session.replay_rejections;
            drop(session);
            let limit = self.config.replay.reject_limit;
            if limit > 0 && rejections >= limit {
                self.metrics.increment(Counter::DefensiveDisconnect);
                warn!(connection_id = %conn, rejections, "Too many replayed envelopes");
                self.teardown(conn, &handle, &SessionError::Replay { seq: decoded.seq })
                    .await;
            }
            return Err(SessionError::Replay { seq: decoded.seq });
        }

        let selected = session
            .keys
            .select(decoded.key_version, now, self.metrics.as_ref())?;
        let slot = selected.slot;
        let aad = decoded.associated_data();
        let plaintext = self
            .engine
            .decrypt(selected.key, decoded.iv, aad, decoded.ciphertext, &handle.cancel)
            .await?;

        session.recv_window.record(decoded.seq, now);
        session.replay_rejections = 0;
        if slot == KeySlot::Retired {
            session.keys.record_hit(decoded.key_version, self.metrics.as_ref());
        }
        if session.rekey.observe(decoded.key_version, now) {
            if session.keys.clear_retired().is_some() {
                self.metrics.increment(Counter::OldKeyCleanedEarly);
                self.metrics.increment(Counter::OldKeyDestroyed);
            }
            self.metrics.increment(Counter::RekeyCommitted);
            handle.wake.notify_one();
            info!(
                connection_id = %conn,
                key_version = decoded.key_version,
                "Peer adopted rotated key"
            );
        }
        drop(session);
        Ok((handle, plaintext))
    }

    /// Encrypt `plaintext` under the current key with the next sequence number.
    async fn seal(&self, handle: &SessionHandle, plaintext: Vec<u8>) -> Result<Envelope, SessionError> {
        let (key, seq) = {
            let mut session = handle.session.lock().await;
            let seq = session.next_send_seq();
            (Arc::clone(session.keys.current()), seq)
        };
        let header = EnvelopeHeader {
            key_id: key.key_id().to_string(),
            seq,
            key_version: key.version(),
        };
        let iv = random_iv();
        let aad = envelope::associated_data(header.key_version, seq);
        let ciphertext = self
            .engine
            .encrypt(key, iv, aad, plaintext, &handle.cancel)
            .await?;
        Ok(envelope::encode(&header, &iv, &ciphertext))
    }

    /// One pass of the rekey task.
    async fn rekey_tick(&self, conn: ConnectionId, handle: &Arc<SessionHandle>) -> ControlFlow<()> {
        let now = clock::now();
        let mut session = handle.session.lock().await;

        if let Some(key_version) = session.rekey.expire_if_due(now) {
            self.metrics.increment(Counter::RekeyExpired);
            warn!(connection_id = %conn, key_version, "Peer missed the rotation deadline");
            if self.config.rekey.disconnect_on_expired {
                drop(session);
                self.teardown(conn, handle, &SessionError::RekeyTimeout { key_version })
                    .await;
                return ControlFlow::Break(());
            }
            if session.keys.clear_retired().is_some() {
                self.metrics.increment(Counter::OldKeyDestroyed);
            }
            session.rekey.recover(now);
            return ControlFlow::Continue(());
        }

        if let Some(key_version) = session.keys.expire_retired(now, self.metrics.as_ref()) {
            debug!(connection_id = %conn, key_version, "Retired key grace window closed");
        }

        if session.rekey.begin(now, false) {
            let next = match next_version(&session) {
                Ok(next) => next,
                Err(e) => {
                    session.rekey.abort(now);
                    warn!(connection_id = %conn, error = %e, "Cannot rotate session key");
                    return ControlFlow::Continue(());
                }
            };
            drop(session);
            if let Err(e) = self.rotate(conn, handle, next, false).await {
                debug!(connection_id = %conn, error = %e, "Scheduled rotation failed");
            }
        }
        ControlFlow::Continue(())
    }

    /// Run a rotation the scheduler already moved to `Scheduled`.
    ///
    /// The `crypt.rekey` round-trip runs without the session lock; the new
    /// key is installed under it once fully derived.
    async fn rotate(
        &self,
        conn: ConnectionId,
        handle: &Arc<SessionHandle>,
        next: u32,
        forced: bool,
    ) -> Result<(), SessionError> {
        self.metrics.increment(Counter::RekeyTriggered);
        let exchange = KeyExchange::new();
        let derived = self
            .request_peer_key(conn, exchange.public_b64(), next)
            .await
            .and_then(|peer| {
                exchange
                    .complete(&peer, next)
                    .map_err(|e| SessionError::Handshake(e.to_string()))
            });

        let now = clock::now();
        let mut session = handle.session.lock().await;
        let key = match derived {
            Ok(key) => key,
            Err(e) => {
                session.rekey.abort(now);
                drop(session);
                handle.wake.notify_one();
                self.metrics.increment(Counter::RekeyFailed);
                warn!(connection_id = %conn, key_version = next, error = %e, "Key rotation failed");
                return Err(e);
            }
        };
        if handle.is_closed() {
            session.rekey.abort(now);
            self.metrics.increment(Counter::RekeyFailed);
            debug!(connection_id = %conn, key_version = next, "Session closed during rotation");
            return Err(SessionError::NoSession);
        }
        if let Err(e) = session.keys.rotate(key, now) {
            session.rekey.abort(now);
            drop(session);
            handle.wake.notify_one();
            self.metrics.increment(Counter::RekeyFailed);
            warn!(connection_id = %conn, key_version = next, error = %e, "Key rotation failed");
            return Err(e);
        }
        let deadline = self.config.rekey.deadline();
        session.rekey.rotated(now + deadline, next);
        drop(session);
        handle.wake.notify_one();
        info!(connection_id = %conn, key_version = next, forced, "Rotated session key");

        if self.config.rekey.force_notify {
            let payload = json!({ "deadline": clock::epoch_ms_after(deadline) });
            match self.channel.emit(conn, EVENT_REKEY_REQUIRED, payload).await {
                Ok(()) => self.metrics.increment(Counter::RekeyForceNotified),
                Err(e) => warn!(connection_id = %conn, error = %e, "Rekey notification failed"),
            }
        }
        Ok(())
    }

    async fn request_peer_key(
        &self,
        conn: ConnectionId,
        server_pub_key: String,
        next: u32,
    ) -> Result<PublicKey, SessionError> {
        let response = self
            .channel
            .request(
                conn,
                EVENT_REKEY,
                json!({ "serverPubKey": server_pub_key, "kv": next }),
                self.config.rekey.ack_timeout(),
            )
            .await?;
        if response.get("result").and_then(Value::as_bool) != Some(true) {
            return Err(SessionError::Handshake("peer refused key rotation".into()));
        }
        let encoded = response
            .pointer("/data/clientPubKey")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::Handshake("missing clientPubKey".into()))?;
        decode_public_key_b64(encoded).map_err(|e| SessionError::Handshake(e.to_string()))
    }
}

fn json_err(e: serde_json::Error) -> SessionError {
    SessionError::Internal(e.to_string())
}

/// Per-session timer: starts rotations when due and enforces deadlines.
fn spawn_rekey_task(
    inner: Weak<Inner>,
    conn: ConnectionId,
    handle: Arc<SessionHandle>,
) -> JoinHandle<()> {
    let mut shutdown = handle.subscribe_shutdown();
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let wake_at = handle.session.lock().await.next_wake();
            let sleep = async {
                match wake_at {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                () = sleep => {
                    let Some(inner) = inner.upgrade() else { break };
                    if inner.rekey_tick(conn, &handle).await.is_break() {
                        break;
                    }
                }
                () = handle.wake.notified() => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!(connection_id = %conn, "Rekey task stopped");
    })
}
