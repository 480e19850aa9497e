//! Time helpers.
//!
//! All session timing reads the tokio clock so paused-time tests drive
//! rekey deadlines and replay TTLs deterministically.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Current instant on the tokio clock.
pub fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Wall-clock milliseconds since the epoch, `after` from now.
pub fn epoch_ms_after(after: Duration) -> u64 {
    let at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .saturating_add(after);
    u64::try_from(at.as_millis()).unwrap_or(u64::MAX)
}
