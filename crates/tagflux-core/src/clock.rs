use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock microseconds since Unix epoch.
pub fn unix_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Pick the timestamp for an acquired sample: device source time first,
/// then server time, then the local clock.
pub fn resolve_timestamp(source_us: Option<u64>, server_us: Option<u64>) -> u64 {
    source_us.or(server_us).unwrap_or_else(unix_us)
}
