//! Protocol counters and histograms.
//!
//! Every cryptographic failure and every rekey transition is counted through
//! a [`MetricsRecorder`]. [`AtomicMetrics`] keeps everything in-process and
//! can be snapshotted; with the `metrics` feature, [`otel::OtelMetrics`]
//! forwards to `OpenTelemetry` instruments.

#[cfg(feature = "metrics")]
pub mod otel;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic protocol counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    HandshakeCompleted,
    HandshakeFailed,
    DecryptFailure,
    EnvelopeRejected,
    PlaintextFallback,
    PlaintextRejected,
    ReplayRejected,
    OldKeyHit,
    OldKeyExpired,
    OldKeyDestroyed,
    OldKeyCleanedEarly,
    RekeyTriggered,
    RekeyFailed,
    RekeyForceNotified,
    RekeyCommitted,
    RekeyExpired,
    CryptoInline,
    CryptoOffloaded,
    DefensiveDisconnect,
    /// Envelopes naming a key version the session cannot serve.
    KeyVersionRejected,
}

impl Counter {
    pub const ALL: [Self; 20] = [
        Self::HandshakeCompleted,
        Self::HandshakeFailed,
        Self::DecryptFailure,
        Self::EnvelopeRejected,
        Self::PlaintextFallback,
        Self::PlaintextRejected,
        Self::ReplayRejected,
        Self::OldKeyHit,
        Self::OldKeyExpired,
        Self::OldKeyDestroyed,
        Self::OldKeyCleanedEarly,
        Self::RekeyTriggered,
        Self::RekeyFailed,
        Self::RekeyForceNotified,
        Self::RekeyCommitted,
        Self::RekeyExpired,
        Self::CryptoInline,
        Self::CryptoOffloaded,
        Self::DefensiveDisconnect,
        Self::KeyVersionRejected,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::HandshakeCompleted => "tailproto_handshake_completed",
            Self::HandshakeFailed => "tailproto_handshake_failed",
            Self::DecryptFailure => "tailproto_decrypt_failures",
            Self::EnvelopeRejected => "tailproto_envelope_rejected",
            Self::PlaintextFallback => "tailproto_plaintext_fallbacks",
            Self::PlaintextRejected => "tailproto_plaintext_rejected",
            Self::ReplayRejected => "tailproto_replay_rejected",
            Self::OldKeyHit => "tailproto_old_key_hits",
            Self::OldKeyExpired => "tailproto_old_key_expired",
            Self::OldKeyDestroyed => "tailproto_old_key_destroyed",
            Self::OldKeyCleanedEarly => "tailproto_old_key_cleaned_early",
            Self::RekeyTriggered => "tailproto_rekey_triggered",
            Self::RekeyFailed => "tailproto_rekey_failed",
            Self::RekeyForceNotified => "tailproto_rekey_force_notified",
            Self::RekeyCommitted => "tailproto_rekey_committed",
            Self::RekeyExpired => "tailproto_rekey_expired",
            Self::CryptoInline => "tailproto_crypto_inline",
            Self::CryptoOffloaded => "tailproto_crypto_offloaded",
            Self::DefensiveDisconnect => "tailproto_defensive_disconnects",
            Self::KeyVersionRejected => "tailproto_key_version_rejected",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// Value distributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Histogram {
    /// AEAD time on the caller's task, microseconds.
    CryptoInlineMicros,
    /// AEAD time including the worker queue, microseconds.
    CryptoOffloadMicros,
    /// Events per `tp.batch` envelope.
    BatchSize,
}

impl Histogram {
    pub const ALL: [Self; 3] = [
        Self::CryptoInlineMicros,
        Self::CryptoOffloadMicros,
        Self::BatchSize,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::CryptoInlineMicros => "tailproto_crypto_inline_us",
            Self::CryptoOffloadMicros => "tailproto_crypto_offload_us",
            Self::BatchSize => "tailproto_batch_size",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// Sink for protocol metrics.
pub trait MetricsRecorder: Send + Sync {
    fn increment(&self, counter: Counter);

    fn record(&self, histogram: Histogram, value: u64);
}

impl<T: MetricsRecorder + ?Sized> MetricsRecorder for Arc<T> {
    fn increment(&self, counter: Counter) {
        (**self).increment(counter);
    }

    fn record(&self, histogram: Histogram, value: u64) {
        (**self).record(histogram, value);
    }
}

/// Fan out to two recorders.
impl<A: MetricsRecorder, B: MetricsRecorder> MetricsRecorder for (A, B) {
    fn increment(&self, counter: Counter) {
        self.0.increment(counter);
        self.1.increment(counter);
    }

    fn record(&self, histogram: Histogram, value: u64) {
        self.0.record(histogram, value);
        self.1.record(histogram, value);
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn increment(&self, _counter: Counter) {}

    fn record(&self, _histogram: Histogram, _value: u64) {}
}

#[derive(Debug, Default)]
struct HistogramCell {
    count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

/// Lock-free in-process recorder.
#[derive(Debug)]
pub struct AtomicMetrics {
    counters: [AtomicU64; Counter::ALL.len()],
    histograms: [HistogramCell; Histogram::ALL.len()],
}

impl Default for AtomicMetrics {
    fn default() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
            histograms: std::array::from_fn(|_| HistogramCell::default()),
        }
    }
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of one counter.
    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = Counter::ALL
            .iter()
            .map(|c| (c.name(), self.get(*c)))
            .collect();
        let histograms = Histogram::ALL
            .iter()
            .map(|h| {
                let cell = &self.histograms[h.index()];
                (
                    h.name(),
                    HistogramSummary {
                        count: cell.count.load(Ordering::Relaxed),
                        sum: cell.sum.load(Ordering::Relaxed),
                        max: cell.max.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();
        MetricsSnapshot {
            counters,
            histograms,
        }
    }
}

impl MetricsRecorder for AtomicMetrics {
    fn increment(&self, counter: Counter) {
        self.counters[counter.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, histogram: Histogram, value: u64) {
        let cell = &self.histograms[histogram.index()];
        cell.count.fetch_add(1, Ordering::Relaxed);
        cell.sum.fetch_add(value, Ordering::Relaxed);
        cell.max.fetch_max(value, Ordering::Relaxed);
    }
}

/// Aggregate of one histogram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: u64,
    pub max: u64,
}

impl HistogramSummary {
    pub fn mean(&self) -> Option<u64> {
        self.sum.checked_div(self.count)
    }
}

/// Point-in-time copy of an [`AtomicMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<&'static str, u64>,
    pub histograms: BTreeMap<&'static str, HistogramSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_names_are_unique() {
        let mut names: Vec<_> = Counter::ALL.iter().map(|c| c.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Counter::ALL.len());
    }

    #[test]
    fn counter_indices_match_table() {
        for (i, c) in Counter::ALL.iter().enumerate() {
            assert_eq!(c.index(), i);
        }
        for (i, h) in Histogram::ALL.iter().enumerate() {
            assert_eq!(h.index(), i);
        }
    }

    #[test]
    fn atomic_metrics_count_and_summarise() {
        let metrics = AtomicMetrics::new();
        metrics.increment(Counter::DecryptFailure);
        metrics.increment(Counter::DecryptFailure);
        metrics.record(Histogram::BatchSize, 3);
        metrics.record(Histogram::BatchSize, 9);

        assert_eq!(metrics.get(Counter::DecryptFailure), 2);
        assert_eq!(metrics.get(Counter::ReplayRejected), 0);

        let snap = metrics.snapshot();
        assert_eq!(snap.counters["tailproto_decrypt_failures"], 2);
        let batch = snap.histograms["tailproto_batch_size"];
        assert_eq!(batch.count, 2);
        assert_eq!(batch.max, 9);
        assert_eq!(batch.mean(), Some(6));
    }

    #[test]
    fn pair_records_into_both() {
        let a = Arc::new(AtomicMetrics::new());
        let b = Arc::new(AtomicMetrics::new());
        let pair = (Arc::clone(&a), Arc::clone(&b));
        pair.increment(Counter::RekeyTriggered);
        pair.record(Histogram::BatchSize, 2);
        assert_eq!(a.get(Counter::RekeyTriggered), 1);
        assert_eq!(b.get(Counter::RekeyTriggered), 1);
        assert_eq!(b.snapshot().histograms["tailproto_batch_size"].sum, 2);
    }

    #[test]
    fn empty_histogram_has_no_mean() {
        assert_eq!(HistogramSummary::default().mean(), None);
    }
}
