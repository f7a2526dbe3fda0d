#[cfg(test)]
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

/// Source of "now" for everything that reasons about due dates.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Calendar day of `now()` in the given timezone.
    fn today(&self, timezone: Tz) -> NaiveDate {
        self.now().with_timezone(&timezone).date_naive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[cfg(test)]
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Whole calendar days from `from` to `to`; negative when `to` is earlier.
pub fn days_between(from: NaiveDate, to: NaiveDate) -> i64 {
    (to - from).num_days()
}

/// Midnight of the instant's calendar day in `timezone`, expressed in UTC.
pub fn start_of_day(instant: DateTime<Utc>, timezone: Tz) -> DateTime<Utc> {
    let local_day = instant.with_timezone(&timezone).date_naive();
    let midnight = local_day.and_hms_opt(0, 0, 0).unwrap_or_default();
    // DST transitions can skip midnight; fall back to the first valid instant.
    timezone
        .from_local_datetime(&midnight)
        .earliest()
        .or_else(|| timezone.from_local_datetime(&(midnight + Duration::hours(1))).earliest())
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or(instant)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate, TimeZone, Utc};
    use chrono_tz::America::Asuncion;
    use chrono_tz::UTC;

    use super::{days_between, start_of_day, Clock, ManualClock};

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("valid date")
    }

    #[test]
    fn counts_days_in_both_directions() {
        assert_eq!(days_between(date("2026-03-01"), date("2026-03-31")), 30);
        assert_eq!(days_between(date("2026-03-31"), date("2026-03-01")), -30);
        assert_eq!(days_between(date("2026-02-28"), date("2026-03-01")), 1);
        assert_eq!(days_between(date("2026-03-01"), date("2026-03-01")), 0);
    }

    #[test]
    fn start_of_day_truncates_in_timezone() {
        let instant = Utc.with_ymd_and_hms(2026, 3, 10, 17, 45, 12).unwrap();
        assert_eq!(
            start_of_day(instant, UTC),
            Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap()
        );

        // 02:00 UTC is still the previous evening in Asuncion (UTC-3).
        let early = Utc.with_ymd_and_hms(2026, 3, 10, 2, 0, 0).unwrap();
        assert_eq!(
            start_of_day(early, Asuncion),
            Utc.with_ymd_and_hms(2026, 3, 9, 3, 0, 0).unwrap()
        );
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 31, 12, 0, 0).unwrap());
        assert_eq!(clock.today(UTC), date("2026-01-31"));

        clock.advance(Duration::days(1));
        assert_eq!(clock.today(UTC), date("2026-02-01"));

        clock.set(Utc.with_ymd_and_hms(2026, 6, 1, 1, 0, 0).unwrap());
        assert_eq!(clock.today(UTC), date("2026-06-01"));
        assert_eq!(clock.today(Asuncion), date("2026-05-31"));
    }
}
