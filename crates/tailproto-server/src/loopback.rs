//! In-process transport for the bench binary and integration tests.
//!
//! [`LoopbackChannel`] implements [`PeerChannel`] by calling straight into a
//! registered [`PeerHandler`] per connection. [`LoopbackClient`] is a handler
//! backed by a [`PeerSession`]; [`EchoDispatcher`] is a trivial application.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tailproto_core::batch::RpcEvent;
use tailproto_crypto::CipherSuite;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::peer::PeerSession;
use crate::transport::{
    ConnectionId, DispatchError, EVENT_BATCH, EVENT_NOTIFY, EVENT_REKEY, EVENT_REKEY_REQUIRED,
    PeerChannel, RpcDispatcher, TransportError,
};

/// Receiving side of a loopback connection.
#[async_trait]
pub trait PeerHandler: Send + Sync {
    async fn on_event(&self, event: &str, payload: Value);

    async fn on_request(&self, event: &str, payload: Value) -> Value;
}

#[derive(Default)]
pub struct LoopbackChannel {
    peers: RwLock<HashMap<ConnectionId, Arc<dyn PeerHandler>>>,
    disconnects: Mutex<Vec<(ConnectionId, String)>>,
}

impl LoopbackChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, conn: ConnectionId, handler: Arc<dyn PeerHandler>) {
        self.peers.write().await.insert(conn, handler);
    }

    pub async fn is_connected(&self, conn: ConnectionId) -> bool {
        self.peers.read().await.contains_key(&conn)
    }

    /// Every server-initiated disconnect so far, with its reason code.
    pub async fn disconnects(&self) -> Vec<(ConnectionId, String)> {
        self.disconnects.lock().await.clone()
    }

    async fn handler(&self, conn: ConnectionId) -> Result<Arc<dyn PeerHandler>, TransportError> {
        self.peers
            .read()
            .await
            .get(&conn)
            .cloned()
            .ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl PeerChannel for LoopbackChannel {
    async fn emit(
        &self,
        conn: ConnectionId,
        event: &str,
        payload: Value,
    ) -> Result<(), TransportError> {
        self.handler(conn).await?.on_event(event, payload).await;
        Ok(())
    }

    async fn request(
        &self,
        conn: ConnectionId,
        event: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let handler = self.handler(conn).await?;
        tokio::time::timeout(timeout, handler.on_request(event, payload))
            .await
            .map_err(|_| TransportError::Timeout(timeout))
    }

    async fn disconnect(&self, conn: ConnectionId, reason: &str) {
        self.peers.write().await.remove(&conn);
        self.disconnects.lock().await.push((conn, reason.to_string()));
    }
}

/// How a [`LoopbackClient`] answers `crypt.rekey`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyBehavior {
    Accept,
    Refuse,
    /// Never answer, so the request times out.
    Ignore,
    /// Answer like `Accept` after the given delay.
    Delay(Duration),
}

/// A peer living in the same process.
pub struct LoopbackClient {
    session: Mutex<PeerSession>,
    rekey: Mutex<RekeyBehavior>,
    pushes: Mutex<Vec<RpcEvent>>,
    rekey_deadlines: Mutex<Vec<u64>>,
    adopt_on_notify: AtomicBool,
}

impl LoopbackClient {
    pub fn new(suite: CipherSuite) -> Self {
        Self::with_session(PeerSession::new(suite))
    }

    pub fn with_session(session: PeerSession) -> Self {
        Self {
            session: Mutex::new(session),
            rekey: Mutex::new(RekeyBehavior::Accept),
            pushes: Mutex::new(Vec::new()),
            rekey_deadlines: Mutex::new(Vec::new()),
            adopt_on_notify: AtomicBool::new(false),
        }
    }

    /// Direct access to the client's protocol state.
    pub const fn session(&self) -> &Mutex<PeerSession> {
        &self.session
    }

    pub async fn set_rekey_behavior(&self, behavior: RekeyBehavior) {
        *self.rekey.lock().await = behavior;
    }

    /// Switch to a staged key as soon as the rotation deadline is announced.
    pub fn adopt_on_notify(&self, enabled: bool) {
        self.adopt_on_notify.store(enabled, Ordering::Relaxed);
    }

    /// Decrypted server pushes, in arrival order.
    pub async fn pushes(&self) -> Vec<RpcEvent> {
        self.pushes.lock().await.clone()
    }

    /// Deadlines (epoch ms) announced by the server.
    pub async fn rekey_deadlines(&self) -> Vec<u64> {
        self.rekey_deadlines.lock().await.clone()
    }

    async fn accept_rekey(&self, payload: &Value) -> Value {
        let answer = self.session.lock().await.handle_rekey_request(payload);
        answer.unwrap_or_else(|e| {
            warn!(error = %e, "Loopback client rejected rotation");
            json!({ "result": false, "error": "tp_handshake" })
        })
    }
}

#[async_trait]
impl PeerHandler for LoopbackClient {
    async fn on_event(&self, event: &str, payload: Value) {
        match event {
            EVENT_REKEY_REQUIRED => {
                if let Some(deadline) = payload.get("deadline").and_then(Value::as_u64) {
                    self.rekey_deadlines.lock().await.push(deadline);
                }
                if self.adopt_on_notify.load(Ordering::Relaxed) {
                    self.session.lock().await.adopt_staged();
                }
            }
            EVENT_NOTIFY | EVENT_BATCH => {
                let opened = self.session.lock().await.open_push(event, &payload);
                match opened {
                    Ok(events) => self.pushes.lock().await.extend(events),
                    Err(e) => warn!(event, error = %e, "Loopback client dropped push"),
                }
            }
            _ => {
                debug!(event, "Loopback client received plaintext event");
                self.pushes.lock().await.push(RpcEvent::new(event, payload));
            }
        }
    }

    async fn on_request(&self, event: &str, payload: Value) -> Value {
        if event != EVENT_REKEY {
            return json!({ "result": false, "error": "unsupported" });
        }
        let behavior = *self.rekey.lock().await;
        match behavior {
            RekeyBehavior::Accept => self.accept_rekey(&payload).await,
            RekeyBehavior::Refuse => json!({ "result": false, "error": "refused" }),
            RekeyBehavior::Ignore => std::future::pending().await,
            RekeyBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                self.accept_rekey(&payload).await
            }
        }
    }
}

/// Echoes `data` back for every event and records what it saw.
///
/// Events whose name starts with `fail:` produce a handler error.
#[derive(Default)]
pub struct EchoDispatcher {
    calls: Mutex<Vec<(ConnectionId, String, Value)>>,
}

impl EchoDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn calls(&self) -> Vec<(ConnectionId, String, Value)> {
        self.calls.lock().await.clone()
    }

    /// Names of dispatched events, in order.
    pub async fn event_names(&self) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .map(|(_, name, _)| name.clone())
            .collect()
    }
}

#[async_trait]
impl RpcDispatcher for EchoDispatcher {
    async fn dispatch(
        &self,
        conn: ConnectionId,
        event: &str,
        data: Value,
    ) -> Result<Value, DispatchError> {
        self.calls
            .lock()
            .await
            .push((conn, event.to_string(), data.clone()));
        if event.starts_with("fail:") {
            return Err(DispatchError::Failed(format!("{event} failed")));
        }
        Ok(data)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_to_unknown_connection_is_closed() {
        let channel = LoopbackChannel::new();
        let result = channel.emit(ConnectionId::new(1), "x", Value::Null).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn ignored_request_times_out() {
        let channel = LoopbackChannel::new();
        let client = Arc::new(LoopbackClient::new(CipherSuite::Aes256Gcm));
        client.set_rekey_behavior(RekeyBehavior::Ignore).await;
        channel.attach(ConnectionId::new(1), client).await;
        let result = channel
            .request(
                ConnectionId::new(1),
                EVENT_REKEY,
                Value::Null,
                Duration::from_secs(5),
            )
            .await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
    }

    #[tokio::test]
    async fn disconnect_detaches_and_records() {
        let channel = LoopbackChannel::new();
        let conn = ConnectionId::new(3);
        channel
            .attach(conn, Arc::new(LoopbackClient::new(CipherSuite::Aes256Gcm)))
            .await;
        assert!(channel.is_connected(conn).await);
        channel.disconnect(conn, "tp_key_expired").await;
        assert!(!channel.is_connected(conn).await);
        assert_eq!(
            channel.disconnects().await,
            vec![(conn, "tp_key_expired".to_string())]
        );
    }

    #[tokio::test]
    async fn echo_dispatcher_fails_marked_events() {
        let dispatcher = EchoDispatcher::new();
        let conn = ConnectionId::new(1);
        assert_eq!(
            dispatcher.dispatch(conn, "ping", json!(1)).await.unwrap(),
            json!(1)
        );
        assert!(dispatcher.dispatch(conn, "fail:x", Value::Null).await.is_err());
        assert_eq!(dispatcher.event_names().await, vec!["ping", "fail:x"]);
    }
}
