//! Sliding-window replay protection for inbound envelopes.
//!
//! The window is anchored at the highest sequence number accepted so far.
//! A sequence number is accepted when it lies strictly above the low
//! watermark (`highest - window`) and has not been recorded within the TTL.
//! Bookkeeping is purged lazily on every successful record.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Default window width in sequence numbers.
pub const DEFAULT_SEQ_WINDOW: u64 = 1024;

/// Default lifetime of a recorded sequence number.
pub const DEFAULT_REPLAY_TTL: Duration = Duration::from_secs(60);

/// Per-session replay window.
#[derive(Debug, Clone)]
pub struct ReplayGuard {
    window: u64,
    ttl: Duration,
    highest: u64,
    /// Accepted sequence numbers and when they were accepted.
    seen: BTreeMap<u64, Instant>,
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new(DEFAULT_SEQ_WINDOW, DEFAULT_REPLAY_TTL)
    }
}

impl ReplayGuard {
    /// Create a guard. A zero-width window is widened to one.
    pub fn new(window: u64, ttl: Duration) -> Self {
        Self {
            window: window.max(1),
            ttl,
            highest: 0,
            seen: BTreeMap::new(),
        }
    }

    /// Highest sequence number accepted so far (0 before the first).
    pub const fn highest_seen(&self) -> u64 {
        self.highest
    }

    /// Sequence numbers at or below this value are always rejected.
    pub const fn low_watermark(&self) -> u64 {
        self.highest.saturating_sub(self.window)
    }

    /// Number of sequence numbers currently tracked.
    pub fn tracked(&self) -> usize {
        self.seen.len()
    }

    /// Check `seq` without recording it.
    pub fn check(&self, seq: u64, now: Instant) -> Result<()> {
        if seq == 0 || seq <= self.low_watermark() {
            return Err(Error::Replay { seq });
        }
        if let Some(at) = self.seen.get(&seq) {
            if now.saturating_duration_since(*at) < self.ttl {
                return Err(Error::Replay { seq });
            }
        }
        Ok(())
    }

    /// Record `seq` as accepted. Call only after [`check`](Self::check)
    /// succeeded and the envelope authenticated.
    pub fn record(&mut self, seq: u64, now: Instant) {
        self.seen.insert(seq, now);
        if seq > self.highest {
            self.highest = seq;
        }
        self.purge(now);
    }

    /// Check and record in one step.
    pub fn accept(&mut self, seq: u64, now: Instant) -> bool {
        if self.check(seq, now).is_err() {
            return false;
        }
        self.record(seq, now);
        true
    }

    /// Forget everything, as after a fresh handshake.
    pub fn reset(&mut self) {
        self.highest = 0;
        self.seen.clear();
    }

    fn purge(&mut self, now: Instant) {
        let floor = self.low_watermark().saturating_add(1);
        self.seen = self.seen.split_off(&floor);
        let ttl = self.ttl;
        self.seen
            .retain(|_, at| now.saturating_duration_since(*at) < ttl);
    }
}
