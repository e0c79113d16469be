use chrono::Utc;

/// Current wall-clock time as milliseconds since the Unix epoch.
///
/// Hosts stamp visibility and flush signals with this value so that dwell
/// durations are measured against the moment the signal happened, not the
/// moment it was processed.
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
