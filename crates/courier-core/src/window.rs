//! Work-window gate
//!
//! Decides whether dispatch may proceed at a given instant and, when it
//! may not, the next instant at which it can.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

/// Daily time range in local time, end exclusive. `start > end` spans midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl WorkHours {
    fn contains(&self, time: NaiveTime) -> bool {
        if self.start < self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }

    fn is_overnight(&self) -> bool {
        self.start > self.end
    }
}

/// Resolved dispatch window of a campaign
#[derive(Debug, Clone, PartialEq)]
pub struct WorkWindow {
    pub timezone: Tz,
    pub hours: Option<WorkHours>,
    pub days: Option<Vec<Weekday>>,
    pub recurrence_end: Option<DateTime<Utc>>,
}

/// Gate result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Dispatch may proceed now
    Allow,
    /// Blocked; the window next opens at `until`
    Wait { until: DateTime<Utc> },
    /// The recurrence end date has passed; the window never opens again
    Closed,
}

impl WorkWindow {
    /// Window without hour or day restrictions
    pub fn always(timezone: Tz) -> Self {
        Self {
            timezone,
            hours: None,
            days: None,
            recurrence_end: None,
        }
    }

    /// Gate check for `now`
    pub fn check(&self, now: DateTime<Utc>) -> GateDecision {
        if self.recurrence_end.is_some_and(|end| now >= end) {
            return GateDecision::Closed;
        }
        if self.is_open(now) {
            return GateDecision::Allow;
        }
        match self.next_open(now) {
            Some(at) if self.recurrence_end.map_or(true, |end| at < end) => {
                GateDecision::Wait { until: at }
            }
            _ => GateDecision::Closed,
        }
    }

    fn is_open(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.timezone);
        if let Some(days) = &self.days {
            if !days.contains(&local.weekday()) {
                return false;
            }
        }
        if let Some(hours) = &self.hours {
            if !hours.contains(local.time()) {
                return false;
            }
        }
        true
    }

    /// Earliest instant after `now` at which the window is open.
    ///
    /// The window can only open at local midnight or at the start time, so
    /// those instants are enumerated over the following week.
    fn next_open(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = now.with_timezone(&self.timezone).date_naive();
        let mut openings = Vec::new();

        for offset in 0..=8 {
            let Some(date) = today.checked_add_signed(Duration::days(offset)) else {
                continue;
            };
            match &self.hours {
                Some(hours) => {
                    openings.push((date, hours.start));
                    if hours.is_overnight() {
                        openings.push((date, NaiveTime::MIN));
                    }
                }
                None => openings.push((date, NaiveTime::MIN)),
            }
        }

        openings
            .into_iter()
            .filter_map(|(date, time)| self.resolve_local(date, time))
            .filter(|at| *at > now && self.is_open(*at))
            .min()
    }

    /// Map a local wall time to an instant, moving past DST gaps
    fn resolve_local(&self, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
        let naive = date.and_time(time);
        let local = match self.timezone.from_local_datetime(&naive) {
            LocalResult::Single(at) => at,
            LocalResult::Ambiguous(earliest, _) => earliest,
            LocalResult::None => self
                .timezone
                .from_local_datetime(&(naive + Duration::hours(1)))
                .earliest()?,
        };
        Some(local.with_timezone(&Utc))
    }
}

/// Convert ISO weekday numbers (1 = Monday) to weekdays
pub fn weekday_from_iso(day: u8) -> Option<Weekday> {
    match day {
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        7 => Some(Weekday::Sun),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn weekdays() -> Vec<Weekday> {
        vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri]
    }

    fn office(tz: Tz) -> WorkWindow {
        WorkWindow {
            timezone: tz,
            hours: Some(WorkHours {
                start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            }),
            days: Some(weekdays()),
            recurrence_end: None,
        }
    }

    #[test]
    fn test_saturday_waits_until_monday_morning() {
        let window = office(chrono_tz::Europe::Moscow);
        // Saturday 2024-03-02 12:00 MSK
        let now = Utc.with_ymd_and_hms(2024, 3, 2, 9, 0, 0).unwrap();
        assert_eq!(
            window.check(now),
            GateDecision::Wait {
                // Monday 2024-03-04 09:00 MSK
                until: Utc.with_ymd_and_hms(2024, 3, 4, 6, 0, 0).unwrap()
            }
        );
    }

    #[test]
    fn test_inside_window_allows() {
        let window = office(chrono_tz::Europe::Moscow);
        // Wednesday 10:30 MSK
        let now = Utc.with_ymd_and_hms(2024, 3, 6, 7, 30, 0).unwrap();
        assert_eq!(window.check(now), GateDecision::Allow);
    }

    #[test]
    fn test_end_is_exclusive() {
        let window = office(chrono_tz::Europe::Moscow);
        // Wednesday 18:00 MSK
        let now = Utc.with_ymd_and_hms(2024, 3, 6, 15, 0, 0).unwrap();
        assert_eq!(
            window.check(now),
            GateDecision::Wait {
                until: Utc.with_ymd_and_hms(2024, 3, 7, 6, 0, 0).unwrap()
            }
        );
    }

    #[test]
    fn test_before_start_waits_same_day() {
        let window = office(chrono_tz::UTC);
        let now = Utc.with_ymd_and_hms(2024, 3, 6, 7, 15, 0).unwrap();
        assert_eq!(
            window.check(now),
            GateDecision::Wait {
                until: Utc.with_ymd_and_hms(2024, 3, 6, 9, 0, 0).unwrap()
            }
        );
    }

    #[test]
    fn test_overnight_hours() {
        let window = WorkWindow {
            timezone: chrono_tz::UTC,
            hours: Some(WorkHours {
                start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            }),
            days: None,
            recurrence_end: None,
        };
        let late = Utc.with_ymd_and_hms(2024, 3, 6, 23, 0, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2024, 3, 7, 5, 59, 0).unwrap();
        let noon = Utc.with_ymd_and_hms(2024, 3, 7, 12, 0, 0).unwrap();
        assert_eq!(window.check(late), GateDecision::Allow);
        assert_eq!(window.check(early), GateDecision::Allow);
        assert_eq!(
            window.check(noon),
            GateDecision::Wait {
                until: Utc.with_ymd_and_hms(2024, 3, 7, 22, 0, 0).unwrap()
            }
        );
    }

    #[test]
    fn test_days_only() {
        let window = WorkWindow {
            timezone: chrono_tz::UTC,
            hours: None,
            days: Some(vec![Weekday::Wed]),
            recurrence_end: None,
        };
        // Monday
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap();
        assert_eq!(
            window.check(now),
            GateDecision::Wait {
                until: Utc.with_ymd_and_hms(2024, 3, 6, 0, 0, 0).unwrap()
            }
        );
    }

    #[test]
    fn test_unrestricted_window() {
        let window = WorkWindow::always(chrono_tz::UTC);
        assert_eq!(window.check(Utc::now()), GateDecision::Allow);
    }

    #[test]
    fn test_recurrence_end() {
        let end = Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap();
        let mut window = office(chrono_tz::UTC);
        window.recurrence_end = Some(end);

        assert_eq!(window.check(end), GateDecision::Closed);

        // Saturday before the end date; next opening (Monday 09:00) is after it
        let saturday = Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap();
        window.recurrence_end = Some(Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap());
        assert_eq!(window.check(saturday), GateDecision::Closed);
    }

    #[test]
    fn test_weekday_from_iso() {
        assert_eq!(weekday_from_iso(1), Some(Weekday::Mon));
        assert_eq!(weekday_from_iso(7), Some(Weekday::Sun));
        assert_eq!(weekday_from_iso(0), None);
    }
}
