//! Per-session key storage with a bounded grace window for the retired key.
//!
//! A session holds exactly one current key and at most one retired key. The
//! retired key is always the immediately preceding version and is honoured
//! for a limited number of envelopes and a limited time after rotation.
//! Keys are reference counted so an in-flight worker job keeps its key alive
//! after demotion; material is zeroized when the last reference drops.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tailproto_core::config::RekeyConfig;
use tailproto_core::metrics::{Counter, MetricsRecorder};
use tailproto_crypto::SessionKey;
use tracing::debug;

use crate::error::SessionError;

/// Limits on retired-key use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GracePolicy {
    /// The retired key is destroyed when its hit counter reaches this value.
    pub max_hits: u32,
    /// The retired key is destroyed once this much time has passed.
    pub window: Duration,
}

impl From<&RekeyConfig> for GracePolicy {
    fn from(config: &RekeyConfig) -> Self {
        Self {
            max_hits: config.old_key_max_hits,
            window: config.grace_window(),
        }
    }
}

#[derive(Debug)]
struct RetiredKey {
    key: Arc<SessionKey>,
    retired_at: Instant,
    hits: u32,
}

/// Which slot satisfied a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySlot {
    Current,
    Retired,
}

/// A key chosen for one inbound envelope.
#[derive(Debug, Clone)]
pub struct SelectedKey {
    pub key: Arc<SessionKey>,
    pub slot: KeySlot,
}

#[derive(Debug)]
pub struct SessionKeyStore {
    current: Arc<SessionKey>,
    retired: Option<RetiredKey>,
    policy: GracePolicy,
}

impl SessionKeyStore {
    pub fn new(key: SessionKey, policy: GracePolicy) -> Self {
        Self {
            current: Arc::new(key),
            retired: None,
            policy,
        }
    }

    pub const fn current(&self) -> &Arc<SessionKey> {
        &self.current
    }

    pub fn current_version(&self) -> u32 {
        self.current.version()
    }

    pub fn retired_version(&self) -> Option<u32> {
        self.retired.as_ref().map(|r| r.key.version())
    }

    /// Retired-key envelopes accepted so far.
    pub fn retired_hits(&self) -> Option<u32> {
        self.retired.as_ref().map(|r| r.hits)
    }

    /// When the retired key's grace window closes, if there is one.
    pub fn retired_expires_at(&self) -> Option<Instant> {
        self.retired
            .as_ref()
            .map(|r| r.retired_at + self.policy.window)
    }

    /// Pick the key for an envelope carrying `key_version`.
    ///
    /// Selecting the retired key does not consume its budget; call
    /// [`record_hit`](Self::record_hit) once the envelope authenticates.
    /// The key serves `max_hits - 1` envelopes, and a lookup that would
    /// exceed either limit destroys it.
    pub fn select(
        &mut self,
        key_version: u32,
        now: Instant,
        metrics: &dyn MetricsRecorder,
    ) -> Result<SelectedKey, SessionError> {
        let current = self.current.version();
        if key_version == current {
            return Ok(SelectedKey {
                key: Arc::clone(&self.current),
                slot: KeySlot::Current,
            });
        }
        if key_version > current {
            metrics.increment(Counter::KeyVersionRejected);
            return Err(SessionError::UnknownKeyVersion { key_version });
        }

        let Some(retired) = self
            .retired
            .as_ref()
            .filter(|r| r.key.version() == key_version)
        else {
            metrics.increment(Counter::KeyVersionRejected);
            return Err(SessionError::KeyExpired { key_version });
        };

        let age = now.saturating_duration_since(retired.retired_at);
        if retired.hits.saturating_add(1) >= self.policy.max_hits || age >= self.policy.window {
            debug!(
                key_version,
                hits = retired.hits,
                age_ms = u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
                "Retired key exceeded its grace window"
            );
            self.destroy_retired(metrics);
            return Err(SessionError::KeyExpired { key_version });
        }

        Ok(SelectedKey {
            key: Arc::clone(&retired.key),
            slot: KeySlot::Retired,
        })
    }

    /// Charge one authenticated envelope to the retired key.
    pub fn record_hit(&mut self, key_version: u32, metrics: &dyn MetricsRecorder) {
        if let Some(retired) = self
            .retired
            .as_mut()
            .filter(|r| r.key.version() == key_version)
        {
            retired.hits = retired.hits.saturating_add(1);
            metrics.increment(Counter::OldKeyHit);
        }
    }

    /// Destroy the retired key if its grace window has closed by `now`.
    pub fn expire_retired(&mut self, now: Instant, metrics: &dyn MetricsRecorder) -> Option<u32> {
        let expires_at = self.retired_expires_at()?;
        if now < expires_at {
            return None;
        }
        self.destroy_retired(metrics)
    }

    fn destroy_retired(&mut self, metrics: &dyn MetricsRecorder) -> Option<u32> {
        metrics.increment(Counter::OldKeyExpired);
        let version = self.clear_retired();
        if version.is_some() {
            metrics.increment(Counter::OldKeyDestroyed);
        }
        version
    }

    /// Install `next` as current and demote the old current key.
    ///
    /// `next` must be exactly one version ahead. Any previously retired key
    /// is dropped.
    pub fn rotate(&mut self, next: SessionKey, now: Instant) -> Result<(), SessionError> {
        let expected = self.current.version().checked_add(1);
        if expected != Some(next.version()) {
            return Err(SessionError::Internal(format!(
                "rotation to key version {} from {}",
                next.version(),
                self.current.version()
            )));
        }
        let previous = std::mem::replace(&mut self.current, Arc::new(next));
        self.retired = Some(RetiredKey {
            key: previous,
            retired_at: now,
            hits: 0,
        });
        Ok(())
    }

    /// Drop the retired key, returning its version if there was one.
    pub fn clear_retired(&mut self) -> Option<u32> {
        self.retired.take().map(|r| r.key.version())
    }
}
