//! Logging setup shared by the bench binary and embedding servers.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use tracing_subscriber::util::TryInitError;

/// `RUST_LOG`, or `default_filter` when it is unset or unparseable.
fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install the global subscriber with either text or JSON lines.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(default_filter: &str, log_json: bool) -> Result<(), TryInitError> {
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter(default_filter))
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .json()
                    .flatten_event(true),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter(default_filter))
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    }
}

/// Like [`init_tracing`], and when `endpoint` is given also start the OTLP
/// pipeline and export spans through it.
///
/// The returned guard must outlive the process's telemetry; call
/// [`MetricsGuard::shutdown`](crate::metrics::otel::MetricsGuard::shutdown)
/// before exit.
#[cfg(feature = "metrics")]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    endpoint: Option<&str>,
) -> Result<Option<crate::metrics::otel::MetricsGuard>, crate::metrics::otel::MetricsError> {
    let guard = endpoint.map(crate::metrics::otel::init_metrics).transpose()?;
    let spans = guard.as_ref().map(|g| g.tracing_layer());

    if log_json {
        tracing_subscriber::registry()
            .with(env_filter(default_filter))
            .with(spans)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .json()
                    .flatten_event(true),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter(default_filter))
            .with(spans)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()?;
    }
    Ok(guard)
}
