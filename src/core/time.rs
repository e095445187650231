//! Wall-clock timestamps.
//!
//! Every timestamp that crosses the store or the wire is Unix epoch
//! milliseconds, matching what mobile clients stamp on their taps.

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}
