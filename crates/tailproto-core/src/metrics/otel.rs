//! `OpenTelemetry` export of protocol metrics.
//!
//! Only compiled with the `metrics` Cargo feature. [`init_metrics`] wires the
//! OTLP exporter for traces and metrics; [`OtelMetrics`] maps every
//! [`Counter`] and [`Histogram`] onto a global-meter instrument.

use opentelemetry::global;
use opentelemetry::metrics::{Counter as OtelCounter, Histogram as OtelHistogram};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;

use super::{Counter, Histogram, MetricsRecorder};

/// Errors that can occur during metrics / tracing pipeline initialisation.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to build an OTLP exporter.
    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(#[from] opentelemetry_otlp::ExporterBuildError),

    /// Failed during `OTel` SDK shutdown or flush.
    #[error("OpenTelemetry SDK error: {0}")]
    Sdk(#[from] opentelemetry_sdk::error::OTelSdkError),

    /// A global tracing subscriber was already installed.
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Keeps the `OpenTelemetry` providers alive.
///
/// Dropping it does not flush; call [`MetricsGuard::shutdown`] before exit.
pub struct MetricsGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl MetricsGuard {
    /// A `tracing` layer exporting spans through this pipeline.
    pub fn tracing_layer<S>(&self) -> OpenTelemetryLayer<S, SdkTracer>
    where
        S: tracing::Subscriber + for<'span> LookupSpan<'span>,
    {
        tracing_opentelemetry::layer().with_tracer(self.tracer_provider.tracer("tailproto"))
    }

    /// Flush and shut down both providers.
    pub fn shutdown(self) -> Result<(), MetricsError> {
        self.tracer_provider.shutdown()?;
        self.meter_provider.shutdown()?;
        Ok(())
    }
}

/// Initialise the OTLP pipeline for traces and metrics.
///
/// * `endpoint` -- OTLP receiver URL, e.g. `"http://localhost:4317"` (gRPC).
pub fn init_metrics(endpoint: &str) -> Result<MetricsGuard, MetricsError> {
    let trace_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(trace_exporter)
        .build();
    global::set_tracer_provider(tracer_provider.clone());

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .build();
    global::set_meter_provider(meter_provider.clone());

    Ok(MetricsGuard {
        tracer_provider,
        meter_provider,
    })
}

/// Recorder backed by the global `OpenTelemetry` meter.
pub struct OtelMetrics {
    counters: Vec<OtelCounter<u64>>,
    histograms: Vec<OtelHistogram<u64>>,
}

impl Default for OtelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl OtelMetrics {
    /// Build instruments on the current global meter provider. Call after
    /// [`init_metrics`].
    pub fn new() -> Self {
        let meter = global::meter("tailproto");
        let counters = Counter::ALL
            .iter()
            .map(|c| meter.u64_counter(c.name()).build())
            .collect();
        let histograms = Histogram::ALL
            .iter()
            .map(|h| meter.u64_histogram(h.name()).build())
            .collect();
        Self {
            counters,
            histograms,
        }
    }
}

impl MetricsRecorder for OtelMetrics {
    fn increment(&self, counter: Counter) {
        if let Some(c) = self.counters.get(counter.index()) {
            c.add(1, &[]);
        }
    }

    fn record(&self, histogram: Histogram, value: u64) {
        if let Some(h) = self.histograms.get(histogram.index()) {
            h.record(value, &[]);
        }
    }
}
