//! TailProto loopback benchmark
//!
//! Runs a client and a session manager in one process over the loopback
//! transport and reports throughput plus the protocol metrics.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, bail};
use clap::Parser;
use serde_json::{Value, json};
use tracing::{info, warn};

use tailproto_core::batch::RpcEvent;
use tailproto_core::config::load_config;
use tailproto_core::metrics::{AtomicMetrics, MetricsRecorder};
#[cfg(not(feature = "metrics"))]
use tailproto_core::tracing_init::init_tracing;
use tailproto_server::loopback::{EchoDispatcher, LoopbackChannel, LoopbackClient};
use tailproto_server::manager::SessionManager;
use tailproto_server::transport::{ConnectionId, EVENT_BATCH, EVENT_INIT, EVENT_INVOKE};

#[derive(Parser, Debug)]
#[command(name = "tailproto-bench")]
#[command(version, about = "TailProto loopback benchmark - handshake, invokes, batches, rekey")]
struct Args {
    /// JSON settings file; `TAILPROTO_*` variables still apply on top.
    #[arg(long, env = "TAILPROTO_CONFIG")]
    config: Option<PathBuf>,

    /// Number of `tp.invoke` round-trips.
    #[arg(long, default_value_t = 1000)]
    invokes: usize,

    /// Payload bytes per invoke. At or above the crypto threshold the
    /// worker pool is used.
    #[arg(long, default_value_t = 256)]
    payload_size: usize,

    /// Number of `tp.batch` round-trips after the invokes.
    #[arg(long, default_value_t = 0)]
    batches: usize,

    /// Events per batch.
    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    /// Force a key rotation after this many invokes.
    #[arg(long)]
    rekey_after: Option<usize>,

    /// OTLP collector endpoint for exporting metrics (needs the `metrics`
    /// feature).
    #[arg(long, env = "TAILPROTO_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log_filter = "tailproto_server=info,tailproto_bench=info";

    let atomic = Arc::new(AtomicMetrics::new());
    #[cfg(feature = "metrics")]
    let (recorder, guard): (Arc<dyn MetricsRecorder>, _) = {
        let guard = tailproto_core::tracing_init::init_tracing_with_metrics(
            log_filter,
            args.log_json,
            args.otlp_endpoint.as_deref(),
        )?;
        let recorder: Arc<dyn MetricsRecorder> = if guard.is_some() {
            let otel = tailproto_core::metrics::otel::OtelMetrics::new();
            Arc::new((Arc::clone(&atomic), otel))
        } else {
            atomic.clone()
        };
        (recorder, guard)
    };
    #[cfg(not(feature = "metrics"))]
    let recorder: Arc<dyn MetricsRecorder> = {
        init_tracing(log_filter, args.log_json).context("failed to install tracing subscriber")?;
        if args.otlp_endpoint.is_some() {
            warn!("Built without the `metrics` feature; ignoring --otlp-endpoint");
        }
        atomic.clone()
    };

    let config = load_config(args.config.as_deref()).context("failed to load configuration")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        cipher = %config.cipher,
        backend = ?config.crypto.backend,
        threshold = config.crypto.batch_threshold,
        "Starting tailproto-bench"
    );

    let channel = Arc::new(LoopbackChannel::new());
    let dispatcher = Arc::new(EchoDispatcher::new());
    let manager = SessionManager::new(config.clone(), channel.clone(), dispatcher, recorder)?;

    let conn = ConnectionId::new(1);
    let client = Arc::new(LoopbackClient::new(config.cipher));
    channel.attach(conn, client.clone()).await;

    let init = client.session().lock().await.init_request();
    let response = manager.handle_inbound(conn, EVENT_INIT, init).await;
    let kv = client.session().lock().await.complete(&response)?;
    info!(connection_id = %conn, key_version = kv, "Handshake complete");

    let payload = Value::String("x".repeat(args.payload_size));
    let started = Instant::now();
    for i in 0..args.invokes {
        if args.rekey_after == Some(i) {
            let rotated = manager.force_rekey(conn).await?;
            info!(after = i, rotated, "Forced key rotation");
        }
        let request = client
            .session()
            .lock()
            .await
            .seal_event(&RpcEvent::new("bench.echo", json!({ "i": i, "p": payload })))?;
        let response = manager.handle_inbound(conn, EVENT_INVOKE, request).await;
        let reply = client.session().lock().await.open_reply(&response)?;
        if !reply.result {
            bail!("invoke {i} failed: {:?}", reply.error);
        }
    }
    let invoke_elapsed = started.elapsed();

    let started = Instant::now();
    for b in 0..args.batches {
        let events: Vec<_> = (0..args.batch_size)
            .map(|i| RpcEvent::new("bench.batch", json!({ "b": b, "i": i })))
            .collect();
        let request = client.session().lock().await.seal_batch(&events)?;
        let response = manager.handle_inbound(conn, EVENT_BATCH, request).await;
        let replies = client.session().lock().await.open_batch_reply(&response)?;
        if replies.len() != events.len() {
            warn!(batch = b, expected = events.len(), got = replies.len(), "Short batch reply");
        }
    }
    let batch_elapsed = started.elapsed();

    let session = manager.session_info(conn).await;
    manager.shutdown().await;

    info!(
        invokes = args.invokes,
        invoke_ms = u64::try_from(invoke_elapsed.as_millis()).unwrap_or(u64::MAX),
        batches = args.batches,
        batch_ms = u64::try_from(batch_elapsed.as_millis()).unwrap_or(u64::MAX),
        session = %serde_json::to_string(&session)?,
        "Benchmark finished"
    );
    info!(metrics = %serde_json::to_string(&atomic.snapshot())?, "Metrics snapshot");

    #[cfg(feature = "metrics")]
    if let Some(guard) = guard {
        guard.shutdown()?;
    }

    Ok(())
}
