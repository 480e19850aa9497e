//! AEAD execution: inline on the caller's task or offloaded to the pool.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use tailproto_core::config::{CryptoBackend, TailProtoConfig};
use tailproto_core::metrics::{Counter, Histogram, MetricsRecorder};
use tailproto_crypto::{CipherSuite, CryptoError, NONCE_SIZE, SessionKey, open, seal};
use tracing::debug;

use crate::error::SessionError;
use crate::worker::WorkerPool;

#[derive(Debug, Clone, Copy)]
enum Direction {
    Seal,
    Open,
}

/// Runs seal/open for every session of a manager.
pub struct CryptoEngine {
    suite: CipherSuite,
    backend: CryptoBackend,
    threshold: usize,
    pool: Option<WorkerPool>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl CryptoEngine {
    /// Build the engine. The worker pool is only started when the backend
    /// can offload.
    pub fn new(
        config: &TailProtoConfig,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Result<Self, SessionError> {
        let pool = match config.crypto.backend {
            CryptoBackend::Inline => None,
            CryptoBackend::Auto | CryptoBackend::Worker => Some(WorkerPool::new(
                config.crypto.workers,
                config.crypto.queue_depth,
            )?),
        };
        Ok(Self {
            suite: config.cipher,
            backend: config.crypto.backend,
            threshold: config.crypto.batch_threshold,
            pool,
            metrics,
        })
    }

    pub const fn suite(&self) -> CipherSuite {
        self.suite
    }

    pub const fn pool(&self) -> Option<&WorkerPool> {
        self.pool.as_ref()
    }

    /// Whether a payload of `len` bytes goes to the worker pool.
    pub fn offloads(&self, len: usize) -> bool {
        match self.backend {
            CryptoBackend::Inline => false,
            CryptoBackend::Worker => true,
            CryptoBackend::Auto => len >= self.threshold,
        }
    }

    /// Encrypt `plaintext`, returning ciphertext with the tag appended.
    pub async fn encrypt(
        &self,
        key: Arc<SessionKey>,
        iv: [u8; NONCE_SIZE],
        aad: Vec<u8>,
        plaintext: Vec<u8>,
        cancel: &Arc<AtomicBool>,
    ) -> Result<Vec<u8>, SessionError> {
        self.run(Direction::Seal, key, iv, aad, plaintext, cancel)
            .await?
            .map_err(|e| SessionError::Internal(e.to_string()))
    }

    /// Authenticate and decrypt. Failures are counted and never touch the key.
    pub async fn decrypt(
        &self,
        key: Arc<SessionKey>,
        iv: [u8; NONCE_SIZE],
        aad: Vec<u8>,
        ciphertext: Vec<u8>,
        cancel: &Arc<AtomicBool>,
    ) -> Result<Vec<u8>, SessionError> {
        self.run(Direction::Open, key, iv, aad, ciphertext, cancel)
            .await?
            .map_err(|e| {
                debug!(error = %e, "Envelope failed authentication");
                self.metrics.increment(Counter::DecryptFailure);
                SessionError::Decrypt
            })
    }

    async fn run(
        &self,
        direction: Direction,
        key: Arc<SessionKey>,
        iv: [u8; NONCE_SIZE],
        aad: Vec<u8>,
        input: Vec<u8>,
        cancel: &Arc<AtomicBool>,
    ) -> Result<Result<Vec<u8>, CryptoError>, SessionError> {
        let len = input.len();
        let suite = self.suite;
        let work = move || match direction {
            Direction::Seal => seal(suite, &key, &iv, &aad, &input),
            Direction::Open => open(suite, &key, &iv, &aad, &input),
        };

        let started = Instant::now();
        let result = match self.pool.as_ref().filter(|_| self.offloads(len)) {
            Some(pool) => {
                let result = pool.run(Arc::clone(cancel), work).await?;
                self.metrics.increment(Counter::CryptoOffloaded);
                self.metrics
                    .record(Histogram::CryptoOffloadMicros, elapsed_micros(started));
                result
            }
            None => {
                let result = work();
                self.metrics.increment(Counter::CryptoInline);
                self.metrics
                    .record(Histogram::CryptoInlineMicros, elapsed_micros(started));
                result
            }
        };
        Ok(result)
    }
}

fn elapsed_micros(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tailproto_core::metrics::AtomicMetrics;
    use tailproto_crypto::{random_iv, test_key};

    use super::*;

    fn engine(backend: CryptoBackend, threshold: usize) -> (CryptoEngine, Arc<AtomicMetrics>) {
        let mut config = TailProtoConfig::default();
        config.crypto.backend = backend;
        config.crypto.batch_threshold = threshold;
        config.crypto.workers = 2;
        let metrics = Arc::new(AtomicMetrics::new());
        let engine = CryptoEngine::new(&config, metrics.clone()).unwrap();
        (engine, metrics)
    }

    fn live() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn backend_selection() {
        let (auto, _) = engine(CryptoBackend::Auto, 2048);
        assert!(!auto.offloads(2047));
        assert!(auto.offloads(2048));
        let (inline, _) = engine(CryptoBackend::Inline, 0);
        assert!(!inline.offloads(usize::MAX));
        assert!(inline.pool().is_none());
        let (worker, _) = engine(CryptoBackend::Worker, 2048);
        assert!(worker.offloads(0));
    }

    #[tokio::test]
    async fn small_payload_stays_inline() {
        let (engine, metrics) = engine(CryptoBackend::Auto, 1024);
        let key = Arc::new(test_key(1));
        let iv = random_iv();
        let ct = engine
            .encrypt(key.clone(), iv, b"aad".to_vec(), b"hello".to_vec(), &live())
            .await
            .unwrap();
        let pt = engine
            .decrypt(key, iv, b"aad".to_vec(), ct, &live())
            .await
            .unwrap();
        assert_eq!(pt, b"hello");
        assert_eq!(metrics.get(Counter::CryptoInline), 2);
        assert_eq!(metrics.get(Counter::CryptoOffloaded), 0);
    }

    #[tokio::test]
    async fn large_payload_is_offloaded() {
        let (engine, metrics) = engine(CryptoBackend::Auto, 1024);
        let key = Arc::new(test_key(1));
        let iv = random_iv();
        let plaintext = vec![7u8; 64 * 1024];
        let ct = engine
            .encrypt(key.clone(), iv, Vec::new(), plaintext.clone(), &live())
            .await
            .unwrap();
        let pt = engine.decrypt(key, iv, Vec::new(), ct, &live()).await.unwrap();
        assert_eq!(pt, plaintext);
        assert_eq!(metrics.get(Counter::CryptoOffloaded), 2);
        let snap = metrics.snapshot();
        assert_eq!(snap.histograms["tailproto_crypto_offload_us"].count, 2);
    }

    #[tokio::test]
    async fn tampered_ciphertext_is_counted() {
        let (engine, metrics) = engine(CryptoBackend::Inline, 0);
        let key = Arc::new(test_key(1));
        let iv = random_iv();
        let mut ct = engine
            .encrypt(key.clone(), iv, Vec::new(), b"data".to_vec(), &live())
            .await
            .unwrap();
        ct[0] ^= 0xff;
        let result = engine.decrypt(key, iv, Vec::new(), ct, &live()).await;
        assert!(matches!(result, Err(SessionError::Decrypt)));
        assert_eq!(metrics.get(Counter::DecryptFailure), 1);
    }

    #[tokio::test]
    async fn cancelled_session_offload_fails() {
        let (engine, _) = engine(CryptoBackend::Worker, 0);
        let cancel = Arc::new(AtomicBool::new(true));
        let result = engine
            .encrypt(Arc::new(test_key(1)), random_iv(), Vec::new(), vec![1], &cancel)
            .await;
        assert!(matches!(result, Err(SessionError::Worker(_))));
    }
}
