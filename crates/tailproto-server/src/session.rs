//! Per-connection session state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::Serialize;
use tailproto_core::ReplayGuard;
use tailproto_core::config::TailProtoConfig;
use tailproto_crypto::SessionKey;
use tokio::sync::{Mutex, Notify, watch};
use uuid::Uuid;

use crate::keystore::{GracePolicy, SessionKeyStore};
use crate::rekey::RekeyScheduler;
use crate::transport::ConnectionId;

/// Mutable state of one established session. Only reachable through the
/// owning [`SessionHandle`]'s lock.
#[derive(Debug)]
pub struct Session {
    pub(crate) connection_id: ConnectionId,
    pub(crate) keys: SessionKeyStore,
    pub(crate) send_seq: u64,
    pub(crate) recv_window: ReplayGuard,
    pub(crate) rekey: RekeyScheduler,
    /// Replay rejections since the last accepted envelope.
    pub(crate) replay_rejections: u32,
    pub(crate) established_at: Instant,
}

impl Session {
    /// Fresh state right after `crypt.init`: `send_seq` 0, empty window.
    pub fn new(
        connection_id: ConnectionId,
        key: SessionKey,
        config: &TailProtoConfig,
        now: Instant,
    ) -> Self {
        Self {
            connection_id,
            keys: SessionKeyStore::new(key, GracePolicy::from(&config.rekey)),
            send_seq: 0,
            recv_window: ReplayGuard::new(config.replay.seq_window, config.replay.ttl()),
            rekey: RekeyScheduler::new(config.rekey.interval(), now),
            replay_rejections: 0,
            established_at: now,
        }
    }

    /// Claim the next outbound sequence number.
    /// The next instant the rekey task has work: a scheduled rotation, the
    /// rotation deadline, or the end of the retired key's grace window.
    pub fn next_wake(&self) -> Option<Instant> {
        match (self.rekey.next_wake(), self.keys.retired_expires_at()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn next_send_seq(&mut self) -> u64 {
        self.send_seq += 1;
        self.send_seq
    }
}

/// Shared handle to a session: the state lock plus the signals used to tear
/// it down.
pub struct SessionHandle {
    pub(crate) session_id: Uuid,
    pub(crate) session: Mutex<Session>,
    /// Set on teardown; pending worker jobs of this session are skipped.
    pub(crate) cancel: Arc<AtomicBool>,
    /// Wakes the rekey task when its next deadline changes.
    pub(crate) wake: Notify,
    shutdown_tx: watch::Sender<bool>,
}

impl SessionHandle {
    pub fn new(session: Session) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            session_id: Uuid::new_v4(),
            session: Mutex::new(session),
            cancel: Arc::new(AtomicBool::new(false)),
            wake: Notify::new(),
            shutdown_tx,
        }
    }

    pub const fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Cancel pending offloads and stop the rekey task.
    pub fn close(&self) {
        self.cancel.store(true, Ordering::Release);
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Point-in-time view of the session for diagnostics.
    pub async fn info(&self) -> SessionInfo {
        let session = self.session.lock().await;
        SessionInfo {
            session_id: self.session_id.to_string(),
            connection_id: session.connection_id.get(),
            key_version: session.keys.current_version(),
            retired_key_version: session.keys.retired_version(),
            send_seq: session.send_seq,
            highest_recv_seq: session.recv_window.highest_seen(),
            rekey_state: session.rekey.state().name(),
            age_ms: u64::try_from(
                crate::clock::now()
                    .saturating_duration_since(session.established_at)
                    .as_millis(),
            )
            .unwrap_or(u64::MAX),
        }
    }
}

/// Serializable session summary. Never contains key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub connection_id: u64,
    pub key_version: u32,
    pub retired_key_version: Option<u32>,
    pub send_seq: u64,
    pub highest_recv_seq: u64,
    pub rekey_state: &'static str,
    pub age_ms: u64,
}
