//! Typed environment lookups for `from_env` config constructors.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Read and parse `key`, falling back to `default` when unset or malformed.
pub fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparseable environment value");
                default
            }
        },
        Err(_) => default,
    }
}

/// Read a duration expressed in milliseconds.
pub fn millis_or(key: &str, default: Duration) -> Duration {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(parse_or(key, default_ms))
}

/// Read a duration expressed in seconds.
pub fn secs_or(key: &str, default: Duration) -> Duration {
    Duration::from_secs(parse_or(key, default.as_secs()))
}
