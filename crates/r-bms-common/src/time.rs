//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Tick-based timestamps and duration helpers."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Log timestamps count 100 ns ticks since the Unix epoch.
pub const TICKS_PER_SECOND: i64 = 10_000_000;
const NANOS_PER_TICK: u32 = 100;

/// Convert a UTC timestamp into 100 ns ticks since the Unix epoch.
///
/// Sub-tick precision is truncated. Saturates for dates outside the
/// representable range.
pub fn to_unix_ticks(time: DateTime<Utc>) -> i64 {
    let sub_ticks = i64::from(time.timestamp_subsec_nanos() / NANOS_PER_TICK);
    time.timestamp()
        .saturating_mul(TICKS_PER_SECOND)
        .saturating_add(sub_ticks)
}

/// Inverse of [`to_unix_ticks`]. Returns `None` outside chrono's range.
pub fn from_unix_ticks(ticks: i64) -> Option<DateTime<Utc>> {
    let seconds = ticks.div_euclid(TICKS_PER_SECOND);
    let nanos = (ticks.rem_euclid(TICKS_PER_SECOND) as u32) * NANOS_PER_TICK;
    DateTime::from_timestamp(seconds, nanos)
}

/// Convert a duration into microseconds, saturating at `u64::MAX`.
pub fn duration_to_micros(duration: Duration) -> u64 {
    duration
        .as_secs()
        .saturating_mul(1_000_000)
        .saturating_add(u64::from(duration.subsec_micros()))
}

/// Convert a chrono duration into a std one, clamping negatives to zero.
pub fn clamp_to_std(duration: chrono::Duration) -> Duration {
    duration.to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn epoch_is_zero_ticks() {
        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        assert_eq!(to_unix_ticks(epoch), 0);
        assert_eq!(from_unix_ticks(0), Some(epoch));
    }

    #[test]
    fn ticks_keep_hundred_nanosecond_precision() {
        let time = Utc.timestamp_opt(1_700_000_000, 123_456_700).unwrap();
        let ticks = to_unix_ticks(time);
        assert_eq!(ticks, 17_000_000_001_234_567);
        assert_eq!(from_unix_ticks(ticks), Some(time));
    }

    #[test]
    fn pre_epoch_ticks_round_trip() {
        let time = Utc.timestamp_opt(-5, 500_000_000).unwrap();
        let ticks = to_unix_ticks(time);
        assert_eq!(ticks, -45_000_000);
        assert_eq!(from_unix_ticks(ticks), Some(time));
    }

    #[test]
    fn negative_chrono_durations_clamp() {
        assert_eq!(clamp_to_std(chrono::Duration::seconds(-3)), Duration::ZERO);
        assert_eq!(
            clamp_to_std(chrono::Duration::milliseconds(1500)),
            Duration::from_millis(1500)
        );
    }
}
