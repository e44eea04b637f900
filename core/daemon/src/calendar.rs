use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;

/// Calendar day (`YYYY-MM-DD`) of `now` in the reference timezone. Daily
/// aggregates are keyed by this, never by the caller's local day.
pub fn date_key(now: DateTime<Utc>, tz: Tz) -> String {
    now.with_timezone(&tz).format("%Y-%m-%d").to_string()
}

/// Fixed-width UTC timestamp, so stored values sort lexically in time order.
pub fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(value: &str) -> DateTime<Utc> {
        parse_rfc3339(value).expect("valid timestamp")
    }

    #[test]
    fn late_utc_evening_is_next_day_in_jerusalem() {
        let tz: Tz = "Asia/Jerusalem".parse().expect("tz");
        assert_eq!(date_key(utc("2026-01-14T22:30:00Z"), tz), "2026-01-15");
        assert_eq!(date_key(utc("2026-01-14T21:30:00Z"), tz), "2026-01-14");
    }

    #[test]
    fn timestamps_are_fixed_width() {
        let whole = timestamp(utc("2026-01-14T22:30:00Z"));
        let fractional = timestamp(utc("2026-01-14T22:30:00.5Z"));
        assert_eq!(whole, "2026-01-14T22:30:00.000Z");
        assert_eq!(fractional, "2026-01-14T22:30:00.500Z");
        assert!(whole < fractional);
    }

    #[test]
    fn follows_daylight_saving_offset() {
        let tz: Tz = "Asia/Jerusalem".parse().expect("tz");
        // UTC+3 in summer, so 21:30Z is already past midnight.
        assert_eq!(date_key(utc("2026-07-14T21:30:00Z"), tz), "2026-07-15");
    }
}
