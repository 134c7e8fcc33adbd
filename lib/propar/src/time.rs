use std::time::SystemTime;

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01).
/// Only ever used to stamp outbound events; scheduling and uptime run on the
/// monotonic clock.
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Millisecond resolution variant of `timestamp_secs`.
#[inline]
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_millis() as u64
}
