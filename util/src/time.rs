//! General time utility functions

use chrono;

/// Number of nanoseconds in a second
pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Convert a duration into a number of seconds, or `None` if overflow
pub fn duration_to_seconds(duration: chrono::Duration) -> Option<f64> {
    if let Some(ns) = duration.num_nanoseconds() {
        Some(ns as f64 / NANOS_PER_SECOND as f64)
    }
    else {
        None
    }
}

/// Convert a number of seconds into a duration, rounded to the nearest nanosecond.
pub fn seconds_to_duration(seconds: f64) -> chrono::Duration {
    chrono::Duration::nanoseconds((seconds * NANOS_PER_SECOND as f64).round() as i64)
}

/// Seconds elapsed from `earlier` to `later`, negative if `later` is before `earlier`.
///
/// Overflowing spans saturate to infinity of the matching sign.
pub fn seconds_between(
    earlier: chrono::DateTime<chrono::Utc>, 
    later: chrono::DateTime<chrono::Utc>
) -> f64 {
    let duration = later - earlier;
    match duration_to_seconds(duration) {
        Some(s) => s,
        None => if duration < chrono::Duration::zero() {
            f64::NEG_INFINITY
        }
        else {
            f64::INFINITY
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_seconds_between() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::milliseconds(250);

        assert_eq!(seconds_between(t0, t1), 0.25);
        assert_eq!(seconds_between(t1, t0), -0.25);
        assert_eq!(seconds_between(t0, t0 + seconds_to_duration(0.1)), 0.1);
    }
}
