#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! End-to-end tests of the inbound and outbound pipeline over the loopback
//! transport: handshake, invoke, batch, replay protection, plaintext policy
//! and server pushes.

mod common;

use serde_json::json;

use common::{Harness, declined};
use tailproto_core::batch::RpcEvent;
use tailproto_core::config::TailProtoConfig;
use tailproto_core::metrics::Counter;
use tailproto_server::SessionError;
use tailproto_server::transport::{ConnectionId, EVENT_INIT, EVENT_INVOKE};

#[tokio::test]
async fn test_handshake_then_invoke_dispatches_once() {
    let h = Harness::established(TailProtoConfig::default()).await;
    assert_eq!(h.count(Counter::HandshakeCompleted), 1);

    let reply = h.invoke_ok("ping", json!({ "n": 1 })).await;
    assert!(reply.result);
    assert_eq!(reply.name, "ping");
    assert_eq!(reply.data, Some(json!({ "n": 1 })));

    let calls = h.dispatcher.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, h.conn);
    assert_eq!(calls[0].1, "ping");

    let info = h.manager.session_info(h.conn).await.unwrap();
    assert_eq!(info.key_version, 1);
    assert_eq!(info.highest_recv_seq, 1);
    assert_eq!(info.send_seq, 1);
}

#[tokio::test]
async fn test_handshake_response_shape() {
    let h = Harness::new(TailProtoConfig::default()).await;
    let init = h.client.session().lock().await.init_request();
    let response = h.manager.handle_inbound(h.conn, EVENT_INIT, init).await;
    assert_eq!(response["result"], true);
    assert!(response["data"]["serverPubKey"].is_string());
    assert_eq!(response["data"]["kv"], 1);
}

#[tokio::test]
async fn test_bad_client_key_is_declined() {
    let h = Harness::new(TailProtoConfig::default()).await;
    for payload in [
        json!({}),
        json!({ "clientPubKey": "not base64!" }),
        json!({ "clientPubKey": "AAAA" }),
    ] {
        let response = h.manager.handle_inbound(h.conn, EVENT_INIT, payload).await;
        assert_eq!(declined(&response), "tp_handshake");
    }
    assert_eq!(h.count(Counter::HandshakeFailed), 3);
    assert_eq!(h.manager.session_count().await, 0);
}

#[tokio::test]
async fn test_invoke_without_session() {
    let h = Harness::new(TailProtoConfig::default()).await;
    let response = h.deliver(json!({})).await;
    assert_eq!(declined(&response), "tp_no_session");
    assert!(h.dispatcher.calls().await.is_empty());
}

#[tokio::test]
async fn test_replayed_envelope_is_rejected() {
    let h = Harness::established(TailProtoConfig::default()).await;
    let payload = h.seal("ping", json!(null)).await;

    assert_eq!(h.deliver(payload.clone()).await["result"], true);
    let response = h.deliver(payload).await;
    assert_eq!(declined(&response), "tp_replay");

    assert_eq!(h.dispatcher.event_names().await, vec!["ping"]);
    assert_eq!(h.count(Counter::ReplayRejected), 1);
    // One rejection is far below the disconnect threshold.
    assert_eq!(h.manager.session_count().await, 1);
}

#[tokio::test]
async fn test_out_of_order_delivery_within_window() {
    let h = Harness::established(TailProtoConfig::default()).await;
    let first = h.seal("a", json!(1)).await;
    let second = h.seal("b", json!(2)).await;

    assert_eq!(h.deliver(second).await["result"], true);
    assert_eq!(h.deliver(first).await["result"], true);
    assert_eq!(h.dispatcher.event_names().await, vec!["b", "a"]);
}

#[tokio::test]
async fn test_repeated_replays_disconnect_the_peer() {
    let mut config = TailProtoConfig::default();
    config.replay.reject_limit = 3;
    let h = Harness::established(config).await;
    let payload = h.seal("ping", json!(null)).await;
    assert_eq!(h.deliver(payload.clone()).await["result"], true);

    for _ in 0..3 {
        let response = h.deliver(payload.clone()).await;
        assert_eq!(declined(&response), "tp_replay");
    }

    assert_eq!(h.count(Counter::DefensiveDisconnect), 1);
    assert_eq!(
        h.channel.disconnects().await,
        vec![(h.conn, "tp_replay".to_string())]
    );
    assert_eq!(h.manager.session_count().await, 0);
    assert_eq!(declined(&h.deliver(payload).await), "tp_no_session");
}

#[tokio::test]
async fn test_accepted_envelope_resets_rejection_streak() {
    let mut config = TailProtoConfig::default();
    config.replay.reject_limit = 2;
    let h = Harness::established(config).await;
    let payload = h.seal("ping", json!(null)).await;
    h.deliver(payload.clone()).await;

    for _ in 0..3 {
        assert_eq!(declined(&h.deliver(payload.clone()).await), "tp_replay");
        assert!(h.invoke_ok("fresh", json!(null)).await.result);
    }
    assert!(h.channel.disconnects().await.is_empty());
}

#[tokio::test]
async fn test_resequenced_envelope_fails_authentication() {
    let h = Harness::established(TailProtoConfig::default()).await;
    let mut payload = h.seal("ping", json!(null)).await;
    payload["s"] = json!(99);

    let response = h.deliver(payload).await;
    assert_eq!(declined(&response), "tp_decrypt");
    assert_eq!(h.count(Counter::DecryptFailure), 1);
    assert!(h.dispatcher.calls().await.is_empty());

    // The failed envelope did not consume its sequence number.
    let info = h.manager.session_info(h.conn).await.unwrap();
    assert_eq!(info.highest_recv_seq, 0);
}

#[tokio::test]
async fn test_future_key_version_is_rejected() {
    let h = Harness::established(TailProtoConfig::default()).await;
    let mut payload = h.seal("ping", json!(null)).await;
    payload["kv"] = json!(5);

    let response = h.deliver(payload).await;
    assert_eq!(declined(&response), "tp_key_version");
    assert_eq!(h.count(Counter::KeyVersionRejected), 1);
    assert_eq!(h.count(Counter::DecryptFailure), 0);
}

#[tokio::test]
async fn test_malformed_envelopes_are_rejected() {
    let h = Harness::established(TailProtoConfig::default()).await;

    assert_eq!(declined(&h.deliver(json!("nope")).await), "tp_envelope");
    assert_eq!(declined(&h.deliver(json!({ "v": 2 })).await), "tp_envelope");

    let mut future = h.seal("ping", json!(null)).await;
    future["v"] = json!(3);
    assert_eq!(declined(&h.deliver(future).await), "tp_envelope");

    assert_eq!(h.count(Counter::EnvelopeRejected), 3);
}

#[tokio::test]
async fn test_batch_replies_in_order_with_errors_inline() {
    let h = Harness::established(TailProtoConfig::default()).await;
    let events = vec![
        RpcEvent::new("a", json!(1)),
        RpcEvent::new("fail:b", json!(2)),
        RpcEvent::new("c", json!(3)),
    ];

    let response = h.batch(&events).await;
    let replies = h
        .client
        .session()
        .lock()
        .await
        .open_batch_reply(&response)
        .unwrap();

    let names: Vec<_> = replies.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["a", "fail:b", "c"]);
    assert!(replies[0].result);
    assert!(!replies[1].result);
    assert!(replies[1].error.is_some());
    assert_eq!(replies[2].data, Some(json!(3)));
    assert_eq!(h.dispatcher.event_names().await, vec!["a", "fail:b", "c"]);

    let snapshot = h.metrics.snapshot();
    let sizes = &snapshot.histograms["tailproto_batch_size"];
    assert_eq!(sizes.count, 1);
    assert_eq!(sizes.sum, 3);
}

#[tokio::test]
async fn test_oversized_batch_is_rejected() {
    let mut config = TailProtoConfig::default();
    config.max_batch_events = 2;
    let h = Harness::established(config).await;
    let events: Vec<_> = (0..3).map(|i| RpcEvent::new("e", json!(i))).collect();

    let response = h.batch(&events).await;
    assert_eq!(declined(&response), "tp_batch");
    assert!(h.dispatcher.calls().await.is_empty());
}

#[tokio::test]
async fn test_large_payload_goes_through_worker_pool() {
    let h = Harness::established(TailProtoConfig::default()).await;
    let big = "x".repeat(16 * 1024);

    let reply = h.invoke_ok("upload", json!(big)).await;
    assert_eq!(reply.data, Some(json!(big)));
    // Both the inbound decrypt and the reply encrypt cross the threshold.
    assert!(h.count(Counter::CryptoOffloaded) >= 2);
    assert!(h.manager.engine().pool().unwrap().executed() >= 2);

    let small = h.invoke_ok("ping", json!(null)).await;
    assert!(small.result);
    assert!(h.count(Counter::CryptoInline) >= 2);
}

#[tokio::test]
async fn test_plaintext_policy_when_optional() {
    let h = Harness::new(TailProtoConfig::default()).await;

    // No session yet: anything passes.
    let response = h
        .manager
        .handle_inbound(h.conn, "chat.send", json!({ "text": "hi" }))
        .await;
    assert_eq!(response, json!({ "result": true, "data": { "text": "hi" } }));

    h.handshake().await;

    let response = h
        .manager
        .handle_inbound(h.conn, "chat.send", json!({ "text": "hi" }))
        .await;
    assert_eq!(declined(&response), "tp_plaintext_rejected");
    assert_eq!(h.count(Counter::PlaintextRejected), 1);

    let response = h
        .manager
        .handle_inbound(h.conn, "login", json!({ "user": "u" }))
        .await;
    assert_eq!(response["result"], true);
    assert_eq!(h.count(Counter::PlaintextFallback), 1);
}

#[tokio::test]
async fn test_plaintext_policy_when_required() {
    let mut config = TailProtoConfig::default();
    config.required = true;
    let h = Harness::new(config).await;

    let response = h
        .manager
        .handle_inbound(h.conn, "chat.send", json!(null))
        .await;
    assert_eq!(declined(&response), "tp_plaintext_rejected");

    let response = h.manager.handle_inbound(h.conn, "login", json!(null)).await;
    assert_eq!(response["result"], true);
    assert_eq!(h.dispatcher.event_names().await, vec!["login"]);
}

#[tokio::test]
async fn test_disabled_protocol_passes_everything_through() {
    let mut config = TailProtoConfig::default();
    config.enabled = false;
    let h = Harness::new(config).await;

    let response = h
        .manager
        .handle_inbound(h.conn, EVENT_INVOKE, json!({ "raw": true }))
        .await;
    assert_eq!(response, json!({ "result": true, "data": { "raw": true } }));
    assert_eq!(h.dispatcher.event_names().await, vec![EVENT_INVOKE]);
    assert_eq!(h.manager.session_count().await, 0);
}

#[tokio::test]
async fn test_server_push_is_encrypted() {
    let h = Harness::established(TailProtoConfig::default()).await;

    h.manager
        .send(h.conn, "chat.message", json!({ "text": "hello" }))
        .await
        .unwrap();
    h.manager
        .send_batch(
            h.conn,
            &[
                RpcEvent::new("tick", json!(1)),
                RpcEvent::new("tick", json!(2)),
            ],
        )
        .await
        .unwrap();
    h.manager.send(h.conn, "login", json!("plain")).await.unwrap();

    let pushes = h.client.pushes().await;
    assert_eq!(
        pushes,
        vec![
            RpcEvent::new("chat.message", json!({ "text": "hello" })),
            RpcEvent::new("tick", json!(1)),
            RpcEvent::new("tick", json!(2)),
            RpcEvent::new("login", json!("plain")),
        ]
    );
    let info = h.manager.session_info(h.conn).await.unwrap();
    assert_eq!(info.send_seq, 2);
}

#[tokio::test]
async fn test_push_without_session_when_required() {
    let mut config = TailProtoConfig::default();
    config.required = true;
    let h = Harness::new(config).await;

    let err = h
        .manager
        .send(h.conn, "chat.message", json!(null))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NoSession));
    assert!(h.client.pushes().await.is_empty());
}

#[tokio::test]
async fn test_second_handshake_replaces_session() {
    let h = Harness::established(TailProtoConfig::default()).await;
    assert!(h.invoke_ok("ping", json!(null)).await.result);
    let first_id = h.manager.session_info(h.conn).await.unwrap().session_id;
    let stale = h.seal("stale", json!(null)).await;

    assert_eq!(h.handshake().await, 1);
    let info = h.manager.session_info(h.conn).await.unwrap();
    assert_ne!(info.session_id, first_id);
    assert_eq!(info.send_seq, 0);
    assert_eq!(info.highest_recv_seq, 0);
    assert_eq!(h.manager.session_count().await, 1);
    assert_eq!(h.count(Counter::HandshakeCompleted), 2);

    // Sealed under the old session's key.
    assert_eq!(declined(&h.deliver(stale).await), "tp_decrypt");
    assert!(h.invoke_ok("ping", json!(null)).await.result);
}

#[tokio::test]
async fn test_connection_closed_drops_session() {
    let h = Harness::established(TailProtoConfig::default()).await;
    h.manager.connection_closed(h.conn).await;

    assert_eq!(h.manager.session_count().await, 0);
    assert!(h.manager.session_info(h.conn).await.is_none());
    assert!(matches!(
        h.manager.force_rekey(h.conn).await,
        Err(SessionError::NoSession)
    ));
}

#[tokio::test]
async fn test_sessions_are_isolated_per_connection() {
    let h = Harness::established(TailProtoConfig::default()).await;
    let other = ConnectionId::new(2);
    let payload = h.seal("ping", json!(null)).await;

    let response = h.manager.handle_inbound(other, EVENT_INVOKE, payload).await;
    assert_eq!(declined(&response), "tp_no_session");
    assert_eq!(h.manager.session_count().await, 1);
}
