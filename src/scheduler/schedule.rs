//! Schedule abstraction: when does a recurring entry fire next?
//!
//! A schedule is a pure function from an instant to the next firing instant
//! strictly after it, interpreted on the wall clock of a timezone with one
//! second resolution. [`RegularSchedule`] matches local-time components
//! against configured sets; [`CustomSchedule`] wraps a user callback.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::offset::LocalResult;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Bound on search steps in `next_after`. Each step skips at least one
/// second and non-matching components skip whole months/days/hours, so any
/// satisfiable field combination resolves in far fewer steps; hitting the
/// bound means the schedule can never fire (e.g. day 31 in February).
const MAX_SEARCH_STEPS: usize = 10_000;

/// Component-set schedule. Empty sets mean "any value". `weekdays` counts
/// from Monday = 0; `days` and `weekdays` are both applied when both are
/// set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegularSchedule {
    pub seconds: BTreeSet<u32>,
    pub minutes: BTreeSet<u32>,
    pub hours: BTreeSet<u32>,
    pub days: BTreeSet<u32>,
    pub weekdays: BTreeSet<u32>,
    pub months: BTreeSet<u32>,
}

impl RegularSchedule {
    /// Fires every second.
    pub fn every_second() -> Self {
        Self::default()
    }

    /// Fires at second 0 of every minute.
    pub fn every_minute() -> Self {
        Self::default().at_seconds([0])
    }

    /// Fires once a day at `hour:minute:00`.
    pub fn daily_at(hour: u32, minute: u32) -> Self {
        Self::default()
            .at_seconds([0])
            .at_minutes([minute])
            .at_hours([hour])
    }

    pub fn at_seconds<I: IntoIterator<Item = u32>>(mut self, seconds: I) -> Self {
        self.seconds = Self::checked("seconds", seconds, 0..=59);
        self
    }

    pub fn at_minutes<I: IntoIterator<Item = u32>>(mut self, minutes: I) -> Self {
        self.minutes = Self::checked("minutes", minutes, 0..=59);
        self
    }

    pub fn at_hours<I: IntoIterator<Item = u32>>(mut self, hours: I) -> Self {
        self.hours = Self::checked("hours", hours, 0..=23);
        self
    }

    pub fn on_days<I: IntoIterator<Item = u32>>(mut self, days: I) -> Self {
        self.days = Self::checked("days", days, 1..=31);
        self
    }

    /// Monday = 0 .. Sunday = 6.
    pub fn on_weekdays<I: IntoIterator<Item = u32>>(mut self, weekdays: I) -> Self {
        self.weekdays = Self::checked("weekdays", weekdays, 0..=6);
        self
    }

    pub fn in_months<I: IntoIterator<Item = u32>>(mut self, months: I) -> Self {
        self.months = Self::checked("months", months, 1..=12);
        self
    }

    fn checked<I: IntoIterator<Item = u32>>(
        field: &str,
        values: I,
        range: std::ops::RangeInclusive<u32>,
    ) -> BTreeSet<u32> {
        let set: BTreeSet<u32> = values.into_iter().collect();
        for v in &set {
            assert!(
                range.contains(v),
                "schedule field `{field}` out of range: {v} not in {range:?}"
            );
        }
        set
    }

    fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz).naive_local();
        let mut t = local.with_nanosecond(0)? + Duration::seconds(1);

        for _ in 0..MAX_SEARCH_STEPS {
            if !field_matches(&self.months, t.month()) {
                t = start_of_next_month(t.date())?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !field_matches(&self.days, t.day())
                || !field_matches(&self.weekdays, t.weekday().num_days_from_monday())
            {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !field_matches(&self.hours, t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !field_matches(&self.minutes, t.minute()) {
                t = t.date().and_hms_opt(t.hour(), t.minute(), 0)? + Duration::minutes(1);
                continue;
            }
            if !field_matches(&self.seconds, t.second()) {
                match self.seconds.range(t.second() + 1..).next() {
                    Some(&s) => t = t.date().and_hms_opt(t.hour(), t.minute(), s)?,
                    None => {
                        t = t.date().and_hms_opt(t.hour(), t.minute(), 0)? + Duration::minutes(1)
                    }
                }
                continue;
            }
            match tz.from_local_datetime(&t) {
                // Fall-back ambiguity resolves to the earlier offset so the
                // occurrence fires once.
                LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
                    return Some(dt.with_timezone(&Utc));
                }
                // Spring-forward gap: this wall-clock time never exists.
                LocalResult::None => {
                    t += Duration::seconds(1);
                }
            }
        }
        None
    }
}

fn field_matches(set: &BTreeSet<u32>, value: u32) -> bool {
    set.is_empty() || set.contains(&value)
}

fn start_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

/// User-defined schedule: a callback that yields the next firing instant
/// strictly after the given one.
#[derive(Clone)]
pub struct CustomSchedule {
    label: String,
    next: Arc<dyn Fn(DateTime<Utc>, Tz) -> Option<DateTime<Utc>> + Send + Sync>,
}

impl CustomSchedule {
    pub fn new<F>(label: impl Into<String>, next: F) -> Self
    where
        F: Fn(DateTime<Utc>, Tz) -> Option<DateTime<Utc>> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            next: Arc::new(next),
        }
    }
}

impl fmt::Debug for CustomSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomSchedule")
            .field("label", &self.label)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum Schedule {
    Regular(RegularSchedule),
    Custom(CustomSchedule),
}

impl Schedule {
    /// Next firing instant strictly after `after`, or `None` if the
    /// schedule never fires again.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Regular(regular) => regular.next_after(after, tz),
            Schedule::Custom(custom) => (custom.next)(after, tz),
        }
    }

    /// Serialized description persisted with the entry record. Informational
    /// only: the scheduler always evaluates the declared in-memory schedule.
    pub fn describe(&self) -> Vec<u8> {
        let blob = match self {
            Schedule::Regular(regular) => ScheduleBlob::Regular(regular.clone()),
            Schedule::Custom(custom) => ScheduleBlob::Custom {
                label: custom.label.clone(),
            },
        };
        serde_json::to_vec(&blob).expect("schedule description serializes")
    }
}

impl From<RegularSchedule> for Schedule {
    fn from(regular: RegularSchedule) -> Self {
        Schedule::Regular(regular)
    }
}

impl From<CustomSchedule> for Schedule {
    fn from(custom: CustomSchedule) -> Self {
        Schedule::Custom(custom)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ScheduleBlob {
    Regular(RegularSchedule),
    Custom { label: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::{America::New_York, UTC};

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_quarter_minute_sequence() {
        let schedule = RegularSchedule::default().at_seconds([0, 15, 30, 45]);
        let mut t = at(2024, 5, 1, 12, 0, 7);
        let mut fires = Vec::new();
        for _ in 0..4 {
            t = schedule.next_after(t, UTC).unwrap();
            fires.push(t);
        }
        assert_eq!(
            fires,
            vec![
                at(2024, 5, 1, 12, 0, 15),
                at(2024, 5, 1, 12, 0, 30),
                at(2024, 5, 1, 12, 0, 45),
                at(2024, 5, 1, 12, 1, 0),
            ]
        );
    }

    #[test]
    fn test_strictly_after() {
        let schedule = RegularSchedule::every_minute();
        let next = schedule.next_after(at(2024, 5, 1, 12, 0, 0), UTC).unwrap();
        assert_eq!(next, at(2024, 5, 1, 12, 1, 0));
    }

    #[test]
    fn test_daily_rollover() {
        let schedule = RegularSchedule::daily_at(9, 30);
        let next = schedule.next_after(at(2024, 5, 1, 10, 0, 0), UTC).unwrap();
        assert_eq!(next, at(2024, 5, 2, 9, 30, 0));
    }

    #[test]
    fn test_weekday_filter_monday_is_zero() {
        // 2024-05-01 is a Wednesday; weekday 0 selects the next Monday.
        let schedule = RegularSchedule::daily_at(8, 0).on_weekdays([0]);
        let next = schedule.next_after(at(2024, 5, 1, 0, 0, 0), UTC).unwrap();
        assert_eq!(next, at(2024, 5, 6, 8, 0, 0));
    }

    #[test]
    fn test_month_and_day_fields() {
        let schedule = RegularSchedule::daily_at(0, 0).on_days([29]).in_months([2]);
        let next = schedule.next_after(at(2023, 3, 1, 0, 0, 0), UTC).unwrap();
        assert_eq!(next, at(2024, 2, 29, 0, 0, 0));
    }

    #[test]
    fn test_unsatisfiable_schedule_returns_none() {
        let schedule = RegularSchedule::daily_at(0, 0).on_days([31]).in_months([2]);
        assert!(schedule.next_after(at(2024, 1, 1, 0, 0, 0), UTC).is_none());
    }

    #[test]
    fn test_dst_gap_is_skipped() {
        // US Eastern sprang forward on 2024-03-10: 02:30 local never
        // happened, so the occurrence moves to the next day.
        let schedule = RegularSchedule::daily_at(2, 30);
        let before = New_York
            .with_ymd_and_hms(2024, 3, 10, 0, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let next = schedule.next_after(before, New_York).unwrap();
        let local = next.with_timezone(&New_York);
        assert_eq!(
            (local.month(), local.day(), local.hour(), local.minute()),
            (3, 11, 2, 30)
        );
    }

    #[test]
    fn test_dst_ambiguity_fires_once_at_earlier_offset() {
        // US Eastern fell back on 2024-11-03: 01:30 local happened twice.
        let schedule = RegularSchedule::daily_at(1, 30);
        let before = New_York
            .with_ymd_and_hms(2024, 11, 3, 0, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let first = schedule.next_after(before, New_York).unwrap();
        // The earlier (EDT, -04:00) rendering of 01:30.
        assert_eq!(first, at(2024, 11, 3, 5, 30, 0));

        // Asking again after the first hit skips the repeated wall time.
        let second = schedule.next_after(first, New_York).unwrap();
        let local = second.with_timezone(&New_York);
        assert_eq!((local.day(), local.hour(), local.minute()), (4, 1, 30));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_field_range_is_validated() {
        let _ = RegularSchedule::default().at_seconds([60]);
    }
}
