use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds since the epoch, used for `last_used_at` /
/// `last_saved_at` / `updated_at` (§3: "monotonic-wall times, seconds").
/// Not a true monotonic clock — acceptable because these timestamps are
/// only ever compared within one process's lifetime for LRU ordering, never
/// used for duration arithmetic across a clock adjustment.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
