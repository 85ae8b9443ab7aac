//! Small helpers shared by all four swap handlers (spec §2 component G):
//! wall-clock reads and the satoshi/token decimal conversions every
//! quoting path needs. Kept separate from [`crate::pricing`] because these
//! are handler-layer conveniences (rounding policy, `SystemTime` access),
//! not quote arithmetic.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in seconds. The sole place handlers read the clock,
/// so tests can reason about nonce/expiry math relative to a single
/// consistent notion of "now".
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
