use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveTime, TimeZone};
use thiserror::Error;

/// Refresh cadence of an alliance: either every N minutes, or daily at a
/// fixed local wall-clock time written as `@HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshInterval {
    Minutes(u32),
    Daily(NaiveTime),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntervalError {
    #[error("empty interval")]
    Empty,
    #[error("interval minutes must be positive")]
    NonPositive,
    #[error("invalid interval: {0}")]
    Invalid(String),
}

/// Parse an alliance interval string. Accepts a positive integer (minutes)
/// or `@HH:MM` (daily at that local time).
pub fn parse_refresh_interval(raw: &str) -> Result<RefreshInterval, IntervalError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(IntervalError::Empty);
    }

    if let Some(hhmm) = raw.strip_prefix('@') {
        let time = NaiveTime::parse_from_str(hhmm, "%H:%M")
            .map_err(|_| IntervalError::Invalid(raw.to_string()))?;
        // Reject seconds smuggled past the format string, e.g. "@3:30:15".
        if hhmm.len() > 5 {
            return Err(IntervalError::Invalid(raw.to_string()));
        }
        return Ok(RefreshInterval::Daily(time));
    }

    let minutes: i64 = raw
        .parse()
        .map_err(|_| IntervalError::Invalid(raw.to_string()))?;
    if minutes <= 0 {
        return Err(IntervalError::NonPositive);
    }
    Ok(RefreshInterval::Minutes(minutes as u32))
}

pub fn format_refresh_interval(interval: &RefreshInterval) -> String {
    match interval {
        RefreshInterval::Minutes(m) => m.to_string(),
        RefreshInterval::Daily(t) => format!("@{}", t.format("%H:%M")),
    }
}

impl RefreshInterval {
    /// Next fire time strictly after `now`. Minute intervals fire a fixed
    /// duration from now; daily intervals fire at the next local occurrence
    /// of their wall-clock time (tomorrow if it already passed today).
    pub fn next_fire_after(&self, now: DateTime<Local>) -> DateTime<Local> {
        match self {
            RefreshInterval::Minutes(m) => now + ChronoDuration::minutes(*m as i64),
            RefreshInterval::Daily(time) => {
                let today = now.date_naive().and_time(*time);
                let candidate = resolve_local(today).unwrap_or(now + ChronoDuration::days(1));
                if candidate > now {
                    candidate
                } else {
                    let tomorrow = (now.date_naive() + ChronoDuration::days(1)).and_time(*time);
                    resolve_local(tomorrow).unwrap_or(now + ChronoDuration::days(1))
                }
            }
        }
    }
}

// DST gaps make some local datetimes nonexistent; take the earliest valid
// mapping and let the caller fall back when there is none.
fn resolve_local(naive: chrono::NaiveDateTime) -> Option<DateTime<Local>> {
    Local.from_local_datetime(&naive).earliest()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minutes() {
        assert_eq!(parse_refresh_interval("60"), Ok(RefreshInterval::Minutes(60)));
        assert_eq!(parse_refresh_interval(" 5 "), Ok(RefreshInterval::Minutes(5)));
    }

    #[test]
    fn parses_daily() {
        assert_eq!(
            parse_refresh_interval("@03:30"),
            Ok(RefreshInterval::Daily(NaiveTime::from_hms_opt(3, 30, 0).unwrap()))
        );
        assert_eq!(
            parse_refresh_interval("@23:59"),
            Ok(RefreshInterval::Daily(NaiveTime::from_hms_opt(23, 59, 0).unwrap()))
        );
    }

    #[test]
    fn rejects_invalid() {
        assert_eq!(parse_refresh_interval(""), Err(IntervalError::Empty));
        assert_eq!(parse_refresh_interval("0"), Err(IntervalError::NonPositive));
        assert_eq!(parse_refresh_interval("-15"), Err(IntervalError::NonPositive));
        assert!(matches!(parse_refresh_interval("@25:00"), Err(IntervalError::Invalid(_))));
        assert!(matches!(parse_refresh_interval("@3:30:15"), Err(IntervalError::Invalid(_))));
        assert!(matches!(parse_refresh_interval("soon"), Err(IntervalError::Invalid(_))));
    }

    #[test]
    fn format_parse_round_trip() {
        for raw in ["1", "60", "1440", "@00:00", "@03:30", "@23:59"] {
            let parsed = parse_refresh_interval(raw).unwrap();
            assert_eq!(
                parse_refresh_interval(&format_refresh_interval(&parsed)).unwrap(),
                parsed
            );
        }
    }

    #[test]
    fn minute_interval_fires_after_duration() {
        let now = Local.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let interval = RefreshInterval::Minutes(90);
        assert_eq!(interval.next_fire_after(now), now + ChronoDuration::minutes(90));
    }

    #[test]
    fn daily_interval_rolls_to_tomorrow_when_passed() {
        let interval = RefreshInterval::Daily(NaiveTime::from_hms_opt(3, 30, 0).unwrap());

        let before = Local.with_ymd_and_hms(2025, 6, 1, 1, 0, 0).unwrap();
        let fire = interval.next_fire_after(before);
        assert_eq!(fire.date_naive(), before.date_naive());
        assert_eq!(fire.time(), NaiveTime::from_hms_opt(3, 30, 0).unwrap());

        let after = Local.with_ymd_and_hms(2025, 6, 1, 4, 0, 0).unwrap();
        let fire = interval.next_fire_after(after);
        assert_eq!(fire.date_naive(), after.date_naive() + ChronoDuration::days(1));

        // Firing exactly at the configured time schedules tomorrow, never now.
        let exact = Local.with_ymd_and_hms(2025, 6, 1, 3, 30, 0).unwrap();
        assert!(interval.next_fire_after(exact) > exact);
    }
}
