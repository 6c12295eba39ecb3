//! # NutriSync Common
//!
//! Logging configuration and small helpers shared by the NutriSync
//! offline gateway crates.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat, LoggingError};

/// Milliseconds since the Unix epoch.
///
/// Clocks set before 1970 report `0` rather than failing.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_millis_monotonic_enough() {
        let a = unix_millis();
        let b = unix_millis();
        assert!(a > 0);
        assert!(b >= a);
    }
}
