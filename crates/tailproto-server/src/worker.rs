//! Bounded pool of OS threads for AEAD work on large payloads.
//!
//! Jobs travel through a bounded queue; each carries a oneshot reply channel
//! and the cancellation flag of the session that submitted it. Workers skip
//! jobs whose session has been torn down, and a reply to a caller that has
//! gone away is simply dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Errors from the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The queue was closed (pool shut down).
    #[error("Crypto worker pool has been closed")]
    Closed,

    /// The job was dropped without a result, usually because its session
    /// was cancelled.
    #[error("Crypto job was cancelled")]
    Cancelled,

    #[error("Failed to spawn crypto worker: {0}")]
    Spawn(#[from] std::io::Error),
}

struct Job {
    cancel: Arc<AtomicBool>,
    work: Box<dyn FnOnce() + Send>,
}

#[derive(Debug, Default)]
struct PoolStats {
    executed: AtomicU64,
    skipped: AtomicU64,
}

pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    threads: Vec<JoinHandle<()>>,
    queue_depth: usize,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    /// Start `workers` threads sharing a queue of `queue_depth` jobs. Zero
    /// values are raised to one.
    pub fn new(workers: usize, queue_depth: usize) -> Result<Self, PoolError> {
        let workers = workers.max(1);
        let queue_depth = queue_depth.max(1);
        let (tx, rx) = mpsc::channel::<Job>(queue_depth);
        let rx = Arc::new(Mutex::new(rx));
        let stats = Arc::new(PoolStats::default());

        let threads = (0..workers)
            .map(|i| {
                let rx = Arc::clone(&rx);
                let stats = Arc::clone(&stats);
                std::thread::Builder::new()
                    .name(format!("tailproto-worker-{i}"))
                    .spawn(move || worker_loop(&rx, &stats))
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(workers, queue_depth, "Crypto worker pool started");
        Ok(Self {
            tx,
            threads,
            queue_depth,
            stats,
        })
    }

    pub fn workers(&self) -> usize {
        self.threads.len()
    }

    pub const fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    /// Jobs handed to a worker thread.
    pub fn executed(&self) -> u64 {
        self.stats.executed.load(Ordering::Relaxed)
    }

    /// Jobs skipped because their session was cancelled.
    pub fn skipped(&self) -> u64 {
        self.stats.skipped.load(Ordering::Relaxed)
    }

    /// Run `f` on a worker thread and wait for its result.
    ///
    /// Waits for queue space when the pool is saturated. Returns
    /// [`PoolError::Cancelled`] if `cancel` was set before a worker picked
    /// the job up.
    pub async fn run<T, F>(&self, cancel: Arc<AtomicBool>, f: F) -> Result<T, PoolError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            cancel,
            work: Box::new(move || {
                let _ = reply_tx.send(f());
            }),
        };
        self.tx.send(job).await.map_err(|_| PoolError::Closed)?;
        reply_rx.await.map_err(|_| PoolError::Cancelled)
    }
}

fn worker_loop(rx: &Mutex<mpsc::Receiver<Job>>, stats: &PoolStats) {
    loop {
        let job = {
            let mut guard = match rx.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.blocking_recv()
        };
        let Some(job) = job else {
            debug!("Crypto worker exiting");
            return;
        };
        if job.cancel.load(Ordering::Acquire) {
            stats.skipped.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        stats.executed.fetch_add(1, Ordering::Relaxed);
        (job.work)();
    }
}
