use std::time::{SystemTime, UNIX_EPOCH};

/// Picks one instance out of `candidates` using the current unix time.
///
/// - no candidates: `None`
/// - one candidate: that candidate
/// - otherwise: `candidates[unix_secs % len]`
///
/// Stateless, so every process rotates through the list at the same pace
/// without sharing a counter.
pub fn select_instance(candidates: &[String], unix_secs: u64) -> Option<&str> {
    match candidates.len() {
        0 => None,
        1 => Some(candidates[0].as_str()),
        len => Some(candidates[(unix_secs % len as u64) as usize].as_str()),
    }
}

/// Seconds since the unix epoch, `0` if the clock is set before it.
pub fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
