//! `TailProto` Core Library
//!
//! Transport-independent pieces of the secure channel:
//! - Envelope codec (`{ v, k, s, kv, iv, d }`) and associated data
//! - Sliding-window replay protection
//! - Batch packing for `tp.batch`
//! - Configuration loading and validation
//! - Protocol metrics and tracing setup

pub mod batch;
pub mod config;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod replay;
pub mod tracing_init;

pub use batch::{RpcEvent, RpcReply};
pub use config::{CryptoBackend, TailProtoConfig, load_config};
pub use envelope::{DecodedEnvelope, Envelope, EnvelopeHeader, PROTOCOL_VERSION};
pub use error::{Error, Result};
pub use metrics::{AtomicMetrics, Counter, Histogram, MetricsRecorder, NoopMetrics};
pub use replay::ReplayGuard;
