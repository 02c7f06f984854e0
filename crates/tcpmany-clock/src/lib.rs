//! Monotonic microsecond clock used to seed sequence numbers and schedule
//! timers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch.
pub type Timestamp = i64;

pub const ONE_MILLI_SECOND: Timestamp = 1_000;
pub const ONE_SECOND: Timestamp = 1_000_000;

/// Current wall-clock time, in microseconds since the Unix epoch.
///
/// Like the original's `gettimeofday`-based `Now()`, this is not guaranteed
/// monotonic across clock adjustments; callers only ever compare
/// differences taken a few seconds apart at most.
pub fn now_us() -> Timestamp {
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    dur.as_micros() as Timestamp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_us_is_plausible() {
        let t = now_us();
        // Some time after 2020-01-01T00:00:00Z.
        assert!(t > 1_577_836_800_000_000);
    }

    #[test]
    fn now_us_is_nondecreasing_across_calls() {
        let a = now_us();
        let b = now_us();
        assert!(b >= a);
    }
}
