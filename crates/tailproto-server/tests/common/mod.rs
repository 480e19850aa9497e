//! Shared setup for the session integration tests: one manager, one
//! loopback client on connection 1.

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::Value;

use tailproto_core::batch::{RpcEvent, RpcReply};
use tailproto_core::config::{CryptoBackend, TailProtoConfig};
use tailproto_core::metrics::{AtomicMetrics, Counter};
use tailproto_server::loopback::{EchoDispatcher, LoopbackChannel, LoopbackClient};
use tailproto_server::manager::SessionManager;
use tailproto_server::transport::{ConnectionId, EVENT_BATCH, EVENT_INIT, EVENT_INVOKE};

pub struct Harness {
    pub manager: SessionManager,
    pub channel: Arc<LoopbackChannel>,
    pub dispatcher: Arc<EchoDispatcher>,
    pub metrics: Arc<AtomicMetrics>,
    pub client: Arc<LoopbackClient>,
    pub conn: ConnectionId,
}

/// Defaults with all AEAD work kept on the calling task.
pub fn inline_config() -> TailProtoConfig {
    let mut config = TailProtoConfig::default();
    config.crypto.backend = CryptoBackend::Inline;
    config
}

impl Harness {
    pub async fn new(config: TailProtoConfig) -> Self {
        let client = LoopbackClient::new(config.cipher);
        Self::with_client(config, client).await
    }

    pub async fn with_client(config: TailProtoConfig, client: LoopbackClient) -> Self {
        let channel = Arc::new(LoopbackChannel::new());
        let dispatcher = Arc::new(EchoDispatcher::new());
        let metrics = Arc::new(AtomicMetrics::new());
        let manager = SessionManager::new(
            config,
            channel.clone(),
            dispatcher.clone(),
            metrics.clone(),
        )
        .unwrap();
        let conn = ConnectionId::new(1);
        let client = Arc::new(client);
        channel.attach(conn, client.clone()).await;
        Self {
            manager,
            channel,
            dispatcher,
            metrics,
            client,
            conn,
        }
    }

    /// A harness whose client already completed `crypt.init`.
    pub async fn established(config: TailProtoConfig) -> Self {
        let harness = Self::new(config).await;
        assert_eq!(harness.handshake().await, 1);
        harness
    }

    pub async fn handshake(&self) -> u32 {
        let init = self.client.session().lock().await.init_request();
        let response = self.manager.handle_inbound(self.conn, EVENT_INIT, init).await;
        self.client
            .session()
            .lock()
            .await
            .complete(&response)
            .unwrap()
    }

    /// Seal one event with the client's next sequence number.
    pub async fn seal(&self, name: &str, data: Value) -> Value {
        self.client
            .session()
            .lock()
            .await
            .seal_event(&RpcEvent::new(name, data))
            .unwrap()
    }

    /// Deliver a sealed `tp.invoke` payload and return the raw response.
    pub async fn deliver(&self, payload: Value) -> Value {
        self.manager
            .handle_inbound(self.conn, EVENT_INVOKE, payload)
            .await
    }

    pub async fn invoke(&self, name: &str, data: Value) -> Value {
        let payload = self.seal(name, data).await;
        self.deliver(payload).await
    }

    pub async fn invoke_ok(&self, name: &str, data: Value) -> RpcReply {
        let response = self.invoke(name, data).await;
        self.client
            .session()
            .lock()
            .await
            .open_reply(&response)
            .unwrap()
    }

    pub async fn batch(&self, events: &[RpcEvent]) -> Value {
        let payload = self
            .client
            .session()
            .lock()
            .await
            .seal_batch(events)
            .unwrap();
        self.manager
            .handle_inbound(self.conn, EVENT_BATCH, payload)
            .await
    }

    pub fn count(&self, counter: Counter) -> u64 {
        self.metrics.get(counter)
    }
}

/// The wire code of a plaintext decline.
pub fn declined(response: &Value) -> &str {
    assert_eq!(response["result"], false, "expected a decline: {response}");
    response["error"].as_str().unwrap()
}
