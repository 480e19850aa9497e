//! Configuration resolution for TailProto.
//!
//! Resolution order:
//! 1. Built-in defaults
//! 2. Optional JSON settings file
//! 3. `TAILPROTO_*` environment variables (highest priority)

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tailproto_crypto::CipherSuite;
use tracing::warn;

use crate::error::{Error, Result};

/// Event names that bypass the encryption pipeline by default.
pub const DEFAULT_PLAINTEXT_WHITELIST: &[&str] = &[
    "crypt.init",
    "crypt.rekey",
    "login",
    "register",
    "resolveToken",
    "notify:tailproto.rekey.required",
];

/// Complete TailProto configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TailProtoConfig {
    /// Master switch. When off every event passes through as plaintext.
    pub enabled: bool,
    /// Reject non-whitelisted plaintext even before a handshake.
    pub required: bool,
    pub cipher: CipherSuite,
    pub rekey: RekeyConfig,
    pub replay: ReplayConfig,
    pub crypto: CryptoConfig,
    /// Upper bound on events in one `tp.batch` envelope.
    pub max_batch_events: usize,
    pub plaintext_whitelist: Vec<String>,
}

impl Default for TailProtoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            required: false,
            cipher: CipherSuite::default(),
            rekey: RekeyConfig::default(),
            replay: ReplayConfig::default(),
            crypto: CryptoConfig::default(),
            max_batch_events: 64,
            plaintext_whitelist: DEFAULT_PLAINTEXT_WHITELIST
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

/// Key rotation timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RekeyConfig {
    pub interval_ms: u64,
    /// Outer bound on how long a retired key is honoured after rotation.
    pub accept_old_ms: u64,
    /// Time the peer has to adopt the new key.
    pub deadline_ms: u64,
    /// Push `notify:tailproto.rekey.required` after each rotation.
    pub force_notify: bool,
    pub disconnect_on_expired: bool,
    pub old_key_max_hits: u32,
    pub old_key_max_duration_ms: u64,
    /// How long to wait for the peer's `crypt.rekey` answer.
    pub ack_timeout_ms: u64,
}

impl Default for RekeyConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            accept_old_ms: 30_000,
            deadline_ms: 30_000,
            force_notify: true,
            disconnect_on_expired: true,
            old_key_max_hits: 50,
            old_key_max_duration_ms: 3_000,
            ack_timeout_ms: 5_000,
        }
    }
}

impl RekeyConfig {
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub const fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Effective retired-key lifetime: the tighter of the two bounds.
    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.old_key_max_duration_ms.min(self.accept_old_ms))
    }
}

/// Replay window settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub ttl_secs: u64,
    pub seq_window: u64,
    /// Consecutive rejections tolerated before a defensive disconnect.
    /// Zero disables the policy.
    pub reject_limit: u32,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            seq_window: 1024,
            reject_limit: 32,
        }
    }
}

impl ReplayConfig {
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Where AEAD work runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CryptoBackend {
    /// Inline below the threshold, worker pool at or above it.
    #[default]
    Auto,
    /// Always on the caller's task.
    Inline,
    /// Always on the worker pool.
    Worker,
}

impl FromStr for CryptoBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "inline" => Ok(Self::Inline),
            "worker" | "pool" => Ok(Self::Worker),
            other => Err(Error::Config(format!("unknown crypto backend '{other}'"))),
        }
    }
}

/// Crypto engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    pub backend: CryptoBackend,
    /// Payload size in bytes at which work is offloaded.
    pub batch_threshold: usize,
    pub workers: usize,
    pub queue_depth: usize,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            backend: CryptoBackend::Auto,
            batch_threshold: 2048,
            workers: default_workers(),
            queue_depth: 256,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
        .min(4)
}

impl TailProtoConfig {
    /// Whether `event` bypasses the encryption pipeline.
    pub fn is_whitelisted(&self, event: &str) -> bool {
        self.plaintext_whitelist.iter().any(|e| e == event)
    }

    /// Reject settings that would make the protocol unusable.
    pub fn validate(&self) -> Result<()> {
        if self.rekey.interval_ms == 0 {
            return Err(Error::Config("rekey.interval_ms must be positive".into()));
        }
        if self.rekey.deadline_ms == 0 {
            return Err(Error::Config("rekey.deadline_ms must be positive".into()));
        }
        if self.rekey.ack_timeout_ms == 0 {
            return Err(Error::Config("rekey.ack_timeout_ms must be positive".into()));
        }
        if self.replay.seq_window == 0 {
            return Err(Error::Config("replay.seq_window must be positive".into()));
        }
        if self.crypto.workers == 0 {
            return Err(Error::Config("crypto.workers must be positive".into()));
        }
        if self.crypto.queue_depth == 0 {
            return Err(Error::Config("crypto.queue_depth must be positive".into()));
        }
        if !self.is_whitelisted("crypt.init") {
            return Err(Error::Config(
                "plaintext_whitelist must contain crypt.init".into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration: defaults, then `path` if given, then the environment.
pub fn load_config(path: Option<&Path>) -> Result<TailProtoConfig> {
    let mut config = match path {
        Some(p) => load_config_file(p)?,
        None => TailProtoConfig::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

fn load_config_file(path: &Path) -> Result<TailProtoConfig> {
    let content = std::fs::read_to_string(path).inspect_err(|e| {
        warn!(path = %path.display(), error = %e, "Failed to read config file");
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(val) = lookup(key) {
        match val.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!(key, value = %val, "Ignoring unparseable environment override"),
        }
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut bool) {
    if let Some(val) = lookup(key) {
        match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => *slot = true,
            "0" | "false" | "no" | "off" => *slot = false,
            _ => warn!(key, value = %val, "Ignoring unparseable boolean override"),
        }
    }
}

/// Apply `TAILPROTO_*` overrides using `lookup` to read variables.
pub fn apply_env_overrides(config: &mut TailProtoConfig, lookup: impl Fn(&str) -> Option<String>) {
    parse_flag(&lookup, "TAILPROTO_ENABLED", &mut config.enabled);
    parse_flag(&lookup, "TAILPROTO_REQUIRED", &mut config.required);
    parse_into(&lookup, "TAILPROTO_CIPHER", &mut config.cipher);

    let rekey = &mut config.rekey;
    parse_into(&lookup, "TAILPROTO_REKEY_INTERVAL_MS", &mut rekey.interval_ms);
    parse_into(&lookup, "TAILPROTO_REKEY_ACCEPT_OLD_MS", &mut rekey.accept_old_ms);
    parse_into(&lookup, "TAILPROTO_REKEY_DEADLINE_MS", &mut rekey.deadline_ms);
    parse_flag(&lookup, "TAILPROTO_REKEY_FORCE_NOTIFY", &mut rekey.force_notify);
    parse_flag(
        &lookup,
        "TAILPROTO_REKEY_DISCONNECT_ON_EXPIRED",
        &mut rekey.disconnect_on_expired,
    );
    parse_into(&lookup, "TAILPROTO_OLD_KEY_MAX_HITS", &mut rekey.old_key_max_hits);
    parse_into(
        &lookup,
        "TAILPROTO_OLD_KEY_MAX_DURATION_MS",
        &mut rekey.old_key_max_duration_ms,
    );
    parse_into(&lookup, "TAILPROTO_ACK_TIMEOUT_MS", &mut rekey.ack_timeout_ms);

    let replay = &mut config.replay;
    parse_into(&lookup, "TAILPROTO_REPLAY_TTL_SECS", &mut replay.ttl_secs);
    parse_into(&lookup, "TAILPROTO_SEQ_WINDOW", &mut replay.seq_window);
    parse_into(&lookup, "TAILPROTO_REPLAY_REJECT_LIMIT", &mut replay.reject_limit);

    let crypto = &mut config.crypto;
    parse_into(&lookup, "TAILPROTO_CRYPTO_BACKEND", &mut crypto.backend);
    parse_into(
        &lookup,
        "TAILPROTO_CRYPTO_BATCH_THRESHOLD",
        &mut crypto.batch_threshold,
    );
    parse_into(&lookup, "TAILPROTO_CRYPTO_WORKERS", &mut crypto.workers);
    parse_into(&lookup, "TAILPROTO_CRYPTO_QUEUE_DEPTH", &mut crypto.queue_depth);

    parse_into(&lookup, "TAILPROTO_MAX_BATCH_EVENTS", &mut config.max_batch_events);

    if let Some(list) = lookup("TAILPROTO_PLAINTEXT_WHITELIST") {
        config.plaintext_whitelist = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();
    }
}
