//! Instant time generation.
//!
//! Instant times come from the wall clock at millisecond resolution. Two
//! instants created in the same millisecond, or a clock that steps backwards,
//! would break the strictly increasing order readers rely on, so every
//! generated time is compared against the last one issued in this process and
//! against a caller-supplied floor (the newest instant on the persisted
//! timeline). When the clock reading is not strictly greater it is advanced one
//! millisecond past the larger of the two.
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use parking_lot::{Mutex, const_mutex};

use crate::timeline::instant::InstantTime;

/// `chrono` format of the second-resolution prefix of an instant time.
const SECONDS_FORMAT: &str = "%Y%m%d%H%M%S";

/// Issues strictly increasing instant times.
///
/// Each generator remembers the last time it handed out. The process-wide
/// generator behind [`next_instant_time`] is what the timeline uses.
#[derive(Debug)]
pub struct InstantTimeGenerator {
    last_issued: Mutex<Option<InstantTime>>,
}

impl InstantTimeGenerator {
    /// A generator that has issued nothing yet.
    pub const fn new() -> Self {
        Self {
            last_issued: const_mutex(None),
        }
    }

    /// Issue a time strictly greater than anything issued before by this
    /// generator and strictly greater than `floor`.
    pub fn next(&self, floor: Option<&InstantTime>) -> InstantTime {
        self.next_at(Utc::now(), floor)
    }

    fn next_at(&self, now: DateTime<Utc>, floor: Option<&InstantTime>) -> InstantTime {
        let mut candidate = format_instant_time(now);
        let mut last = self.last_issued.lock();

        let lower = match (last.as_ref(), floor) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        if let Some(lower) = lower
            && candidate <= *lower
        {
            candidate = successor(lower);
        }

        *last = Some(candidate.clone());
        candidate
    }
}

impl Default for InstantTimeGenerator {
    fn default() -> Self {
        Self::new()
    }
}

static GENERATOR: InstantTimeGenerator = InstantTimeGenerator::new();

/// Format a UTC timestamp as an instant time.
pub fn format_instant_time(at: DateTime<Utc>) -> InstantTime {
    let s = format!(
        "{}{:03}",
        at.format(SECONDS_FORMAT),
        at.timestamp_subsec_millis()
    );
    InstantTime::parse(&s).unwrap_or_else(|| unreachable_instant_time(&s))
}

#[cold]
fn unreachable_instant_time(s: &str) -> InstantTime {
    // Years outside 0..=9999 do not fit the fixed-width format; clamp to the
    // largest representable time rather than producing a malformed key.
    log::warn!("clock produced an out-of-range instant time (raw={s})");
    InstantTime::new_unchecked("99991231235959999".to_string())
}

/// Parse an instant time back into a UTC timestamp.
pub fn parse_instant_time(t: &InstantTime) -> Option<DateTime<Utc>> {
    let s = t.as_str();
    let seconds = NaiveDateTime::parse_from_str(&s[..14], SECONDS_FORMAT).ok()?;
    let millis: i64 = s[14..].parse().ok()?;
    Some(seconds.and_utc() + Duration::milliseconds(millis))
}

/// The smallest instant time strictly greater than `t`.
pub fn successor(t: &InstantTime) -> InstantTime {
    match parse_instant_time(t) {
        Some(at) => format_instant_time(at + Duration::milliseconds(1)),
        None => {
            // Not a calendar time (hand-written fixtures); fall back to numeric order.
            let n: u64 = t.as_str().parse().unwrap_or(0);
            InstantTime::parse(&format!("{:017}", n.saturating_add(1)))
                .unwrap_or_else(|| t.clone())
        }
    }
}

/// Issue a fresh instant time from the process-wide generator.
pub fn next_instant_time(floor: Option<&InstantTime>) -> InstantTime {
    GENERATOR.next(floor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s)
            .single()
            .expect("valid UTC timestamp")
    }

    #[test]
    fn format_and_parse_agree() {
        let at = utc(2025, 3, 4, 5, 6, 7) + Duration::milliseconds(89);
        let t = format_instant_time(at);
        assert_eq!(t.as_str(), "20250304050607089");
        assert_eq!(parse_instant_time(&t), Some(at));
    }

    #[test]
    fn successor_carries_across_second_boundaries() {
        let t = InstantTime::parse("20250101235959999").expect("valid");
        assert_eq!(successor(&t).as_str(), "20250102000000000");
    }

    #[test]
    fn same_millisecond_is_advanced() {
        let generator = InstantTimeGenerator::new();
        let now = utc(2030, 1, 1, 0, 0, 0);
        let a = generator.next_at(now, None);
        let b = generator.next_at(now, None);
        assert!(b > a, "{b} must be greater than {a}");
    }

    #[test]
    fn floor_from_persisted_timeline_is_respected() {
        // A clock far behind the floor still yields a time after it.
        let generator = InstantTimeGenerator::new();
        let floor = InstantTime::parse("40000101000000000").expect("valid");
        let t = generator.next_at(utc(2001, 1, 1, 0, 0, 0), Some(&floor));
        assert!(t > floor);
    }

    #[test]
    fn successive_calls_strictly_increase() {
        let mut prev = next_instant_time(None);
        for _ in 0..1_000 {
            let next = next_instant_time(None);
            assert!(next > prev);
            prev = next;
        }
    }
}
