//! Key rotation state machine.
//!
//! ```text
//! Idle ──due/forced──▶ Scheduled ──peer acked──▶ AwaitingPeerRotation
//!  ▲                      │                        │            │
//!  └────── ack failed ────┘      new kv observed ◀─┘            │ deadline
//!  ▲                                                            ▼
//!  └──────────────────────── recover ◀──────────────────────  Expired
//! ```
//!
//! The scheduler is pure bookkeeping; the session manager drives it from a
//! per-session timer task and from the inbound envelope path.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyState {
    Idle,
    /// A `crypt.rekey` round-trip is in progress.
    Scheduled { forced: bool },
    /// The server already encrypts with `target`; the peer must follow.
    AwaitingPeerRotation {
        deadline: Instant,
        target: u32,
        forced: bool,
    },
    Expired,
}

impl RekeyState {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scheduled { .. } => "scheduled",
            Self::AwaitingPeerRotation { .. } => "awaiting_peer_rotation",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RekeyScheduler {
    state: RekeyState,
    interval: Duration,
    next_due: Instant,
}

impl RekeyScheduler {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            state: RekeyState::Idle,
            interval,
            next_due: now + interval,
        }
    }

    pub const fn state(&self) -> RekeyState {
        self.state
    }

    pub const fn next_due(&self) -> Instant {
        self.next_due
    }

    /// When the timer task should next look at this session. `None` while a
    /// transition is being driven elsewhere.
    pub const fn next_wake(&self) -> Option<Instant> {
        match self.state {
            RekeyState::Idle => Some(self.next_due),
            RekeyState::AwaitingPeerRotation { deadline, .. } => Some(deadline),
            RekeyState::Scheduled { .. } | RekeyState::Expired => None,
        }
    }

    /// Idle → Scheduled when the interval has elapsed, or unconditionally
    /// when `forced`. Returns whether the transition happened.
    pub fn begin(&mut self, now: Instant, forced: bool) -> bool {
        if self.state != RekeyState::Idle || (!forced && now < self.next_due) {
            return false;
        }
        self.state = RekeyState::Scheduled { forced };
        true
    }

    /// Scheduled → Idle after a failed round-trip; the interval restarts.
    pub fn abort(&mut self, now: Instant) {
        if matches!(self.state, RekeyState::Scheduled { .. }) {
            self.state = RekeyState::Idle;
            self.next_due = now + self.interval;
        }
    }

    /// Scheduled → AwaitingPeerRotation once the new key is installed.
    pub fn rotated(&mut self, deadline: Instant, target: u32) {
        if let RekeyState::Scheduled { forced } = self.state {
            self.state = RekeyState::AwaitingPeerRotation {
                deadline,
                target,
                forced,
            };
        }
    }

    /// Note an authenticated envelope under `key_version`. Returns `true`
    /// when this commits a pending rotation (→ Idle, interval restarts).
    pub fn observe(&mut self, key_version: u32, now: Instant) -> bool {
        match self.state {
            RekeyState::AwaitingPeerRotation { target, .. } if target == key_version => {
                self.state = RekeyState::Idle;
                self.next_due = now + self.interval;
                true
            }
            _ => false,
        }
    }

    /// AwaitingPeerRotation → Expired once the deadline has passed. Returns
    /// the key version the peer failed to adopt.
    pub fn expire_if_due(&mut self, now: Instant) -> Option<u32> {
        match self.state {
            RekeyState::AwaitingPeerRotation {
                deadline, target, ..
            } if now >= deadline => {
                self.state = RekeyState::Expired;
                Some(target)
            }
            _ => None,
        }
    }

    /// Expired → Idle when the session is kept alive after a missed deadline.
    pub fn recover(&mut self, now: Instant) {
        if self.state == RekeyState::Expired {
            self.state = RekeyState::Idle;
            self.next_due = now + self.interval;
        }
    }
}
