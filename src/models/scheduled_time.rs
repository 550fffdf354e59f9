use std::fmt;

use serde::{Deserialize, Serialize};
use time::{Duration, Time, UtcOffset};

use crate::core::time::Timestamp;
use crate::models::ModelError;

// Keeps the total of a duration comfortably inside i64 nanoseconds.
const MAX_NSECS: i64 = i64::MAX / 10;
const MAX_MSECS: i64 = MAX_NSECS / 1_000_000;
const MAX_SECS: i64 = MAX_MSECS / 1000;
const MAX_MINS: i64 = MAX_SECS / 60;
const MAX_HOURS: i64 = MAX_MINS / 60;
const MAX_DAYS: i64 = MAX_HOURS / 24;

const MSECS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct DurationSpec {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub(crate) days: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub(crate) hours: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub(crate) minutes: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub(crate) seconds: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub(crate) msecs: i64,
}

/// `HH:MM` or `HH:MM:SS` on a 24 hour clock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct TimeOfDaySpec(pub(crate) String);

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct ScheduledTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) every: Option<DurationSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) daily: Option<TimeOfDaySpec>,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

impl DurationSpec {
    pub(crate) fn from_days(days: i64) -> Self {
        Self { days, ..Self::default() }
    }

    pub(crate) fn from_msecs(msecs: i64) -> Self {
        Self { msecs, ..Self::default() }
    }

    pub(crate) fn validate(&self) -> Result<(), ModelError> {
        let checks = [
            ("days", self.days, MAX_DAYS),
            ("hours", self.hours, MAX_HOURS),
            ("minutes", self.minutes, MAX_MINS),
            ("seconds", self.seconds, MAX_SECS),
            ("milliseconds", self.msecs, MAX_MSECS),
        ];

        for (name, value, max) in checks {
            if value < 0 {
                return Err(ModelError::InvalidTime(format!(
                    "duration has a negative number of {name} ({value})"
                )));
            }

            if value >= max {
                return Err(ModelError::InvalidTime(format!(
                    "duration has too many {name} ({value}), max: {}",
                    max - 1
                )));
            }
        }

        if self.total_msecs_checked().is_none() {
            return Err(ModelError::InvalidTime(String::from("duration is too long")));
        }

        Ok(())
    }

    fn total_msecs_checked(&self) -> Option<i64> {
        self.days
            .checked_mul(MSECS_PER_DAY)?
            .checked_add(self.hours.checked_mul(3_600_000)?)?
            .checked_add(self.minutes.checked_mul(60_000)?)?
            .checked_add(self.seconds.checked_mul(1000)?)?
            .checked_add(self.msecs)
    }

    pub(crate) fn total_msecs(&self) -> i64 {
        self.total_msecs_checked().unwrap_or(i64::MAX)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.total_msecs() == 0
    }

    pub(crate) fn compute_next(&self, start: Timestamp) -> Timestamp {
        start.add_msecs(self.total_msecs())
    }

    /// Only the populated parts: `every 1 days, 2 hours`.
    pub(crate) fn short_string(&self) -> String {
        let parts: Vec<String> = [
            (self.days, "days"),
            (self.hours, "hours"),
            (self.minutes, "minutes"),
            (self.seconds, "seconds"),
        ]
        .into_iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| format!("{value} {unit}"))
        .collect();

        format!("every {}", parts.join(", "))
    }
}

impl fmt::Display for DurationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "every {} days, {} hours, {} minutes, {} seconds; ({} total seconds)",
            self.days,
            self.hours,
            self.minutes,
            self.seconds,
            self.total_msecs() / 1000
        )
    }
}

impl TimeOfDaySpec {
    pub(crate) fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub(crate) fn parse(&self) -> Result<Time, ModelError> {
        let raw = self.0.trim();
        let parts: Vec<&str> = raw.split(':').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err(ModelError::InvalidTime(format!(
                "time of day must be 'HH:MM' or 'HH:MM:SS', found '{raw}'"
            )));
        }

        let mut numbers = [0u8; 3];
        for (index, part) in parts.iter().enumerate() {
            numbers[index] = part.parse::<u8>().map_err(|_| {
                ModelError::InvalidTime(format!("time of day has a bad component in '{raw}'"))
            })?;
        }

        Time::from_hms(numbers[0], numbers[1], numbers[2])
            .map_err(|err| ModelError::InvalidTime(format!("time of day '{raw}': {err}")))
    }

    pub(crate) fn validate(&self) -> Result<(), ModelError> {
        self.parse().map(|_| ())
    }

    /// The first moment at this wall-clock time that is not before `start`.
    pub(crate) fn compute_next(&self, start: Timestamp, offset: UtcOffset) -> Timestamp {
        let Ok(time_of_day) = self.parse() else {
            return start;
        };

        let local_start = start.to_datetime_at(offset);
        let mut next = local_start.replace_time(time_of_day);
        while next < local_start {
            next += Duration::days(1);
        }

        Timestamp::from_datetime(next)
    }
}

impl fmt::Display for TimeOfDaySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parse() {
            Ok(value) => write!(
                f,
                "daily at {:02}:{:02}:{:02}",
                value.hour(),
                value.minute(),
                value.second()
            ),
            Err(_) => write!(f, "daily at <invalid '{}'>", self.0),
        }
    }
}

impl ScheduledTime {
    pub(crate) fn every(spec: DurationSpec) -> Self {
        Self { every: Some(spec), daily: None }
    }

    pub(crate) fn daily(value: &str) -> Self {
        Self { every: None, daily: Some(TimeOfDaySpec(value.to_string())) }
    }

    fn populated_every(&self) -> Option<&DurationSpec> {
        self.every.as_ref().filter(|spec| !spec.is_empty())
    }

    fn populated_daily(&self) -> Option<&TimeOfDaySpec> {
        self.daily.as_ref().filter(|spec| !spec.is_empty())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.populated_every().is_none() && self.populated_daily().is_none()
    }

    pub(crate) fn is_daily(&self) -> bool {
        self.populated_daily().is_some()
    }

    /// Exactly one form must be populated, and it must be well formed.
    pub(crate) fn validate(&self) -> Result<(), ModelError> {
        if let Some(every) = &self.every {
            every.validate()?;
        }

        match (self.populated_every(), self.populated_daily()) {
            (None, None) => Err(ModelError::InvalidTime(String::from(
                "scheduled time has neither 'every' nor 'daily' set",
            ))),
            (Some(_), Some(_)) => Err(ModelError::InvalidTime(String::from(
                "scheduled time cannot have both 'every' and 'daily' set",
            ))),
            (None, Some(daily)) => daily.validate(),
            (Some(_), None) => Ok(()),
        }
    }

    /// The smallest gap between two runs, in milliseconds.
    pub(crate) fn period_msecs(&self) -> i64 {
        match self.populated_every() {
            Some(every) => every.total_msecs(),
            None => MSECS_PER_DAY,
        }
    }

    pub(crate) fn compute_next(&self, start: Timestamp, offset: UtcOffset) -> Timestamp {
        if let Some(every) = self.populated_every() {
            return every.compute_next(start);
        }

        match self.populated_daily() {
            Some(daily) => daily.compute_next(start, offset),
            None => start,
        }
    }
}

impl fmt::Display for ScheduledTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(every) = self.populated_every() {
            return write!(f, "{every}");
        }

        match self.populated_daily() {
            Some(daily) => write!(f, "{daily}"),
            None => f.write_str("<empty>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(value: &str) -> Timestamp {
        Timestamp::parse_rfc3339(value).expect("timestamp")
    }

    #[test]
    fn validate_requires_exactly_one_form() {
        assert!(ScheduledTime::default().validate().is_err());
        assert!(ScheduledTime::every(DurationSpec::default()).validate().is_err());
        assert!(ScheduledTime::every(DurationSpec::from_days(1)).validate().is_ok());
        assert!(ScheduledTime::daily("10:30").validate().is_ok());
        assert!(ScheduledTime::daily("  ").validate().is_err());

        let both = ScheduledTime {
            every: Some(DurationSpec::from_days(1)),
            daily: Some(TimeOfDaySpec(String::from("10:30"))),
        };
        assert!(both.validate().is_err());
    }

    #[test]
    fn negative_components_are_rejected() {
        let spec = DurationSpec { days: 1, hours: -1, ..DurationSpec::default() };
        assert!(ScheduledTime::every(spec).validate().is_err());

        let spec = DurationSpec { days: MAX_DAYS, ..DurationSpec::default() };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn time_of_day_parsing() {
        assert!(TimeOfDaySpec(String::from("23:59:59")).validate().is_ok());
        assert!(TimeOfDaySpec(String::from("00:00")).validate().is_ok());
        assert!(TimeOfDaySpec(String::from("24:00")).validate().is_err());
        assert!(TimeOfDaySpec(String::from("12:60")).validate().is_err());
        assert!(TimeOfDaySpec(String::from("12")).validate().is_err());
        assert!(TimeOfDaySpec(String::from("1:2:3:4")).validate().is_err());
        assert!(TimeOfDaySpec(String::from("ab:cd")).validate().is_err());
    }

    #[test]
    fn every_adds_duration() {
        let spec = DurationSpec { hours: 1, minutes: 30, ..DurationSpec::default() };
        let start = ts("2024-01-01T00:00:00Z");
        let next = ScheduledTime::every(spec).compute_next(start, UtcOffset::UTC);
        assert_eq!(next, ts("2024-01-01T01:30:00Z"));
    }

    #[test]
    fn daily_equal_to_now_fires_today() {
        let start = ts("2024-01-01T10:30:00Z");
        let next = ScheduledTime::daily("10:30").compute_next(start, UtcOffset::UTC);
        assert_eq!(next, start);
    }

    #[test]
    fn daily_before_now_fires_tomorrow() {
        let start = ts("2024-01-01T10:30:01Z");
        let next = ScheduledTime::daily("10:30").compute_next(start, UtcOffset::UTC);
        assert_eq!(next, ts("2024-01-02T10:30:00Z"));
    }

    #[test]
    fn daily_after_now_fires_later_today() {
        let start = ts("2024-01-01T08:00:00Z");
        let next = ScheduledTime::daily("10:30:15").compute_next(start, UtcOffset::UTC);
        assert_eq!(next, ts("2024-01-01T10:30:15Z"));
    }

    #[test]
    fn daily_respects_offset() {
        let offset = UtcOffset::from_hms(2, 0, 0).expect("offset");
        let start = ts("2024-01-01T07:00:00Z");
        let next = ScheduledTime::daily("10:00").compute_next(start, offset);
        assert_eq!(next, ts("2024-01-01T08:00:00Z"));
    }

    #[test]
    fn strings() {
        let spec = DurationSpec { days: 1, hours: 2, ..DurationSpec::default() };
        assert_eq!(spec.short_string(), "every 1 days, 2 hours");
        assert_eq!(
            spec.to_string(),
            "every 1 days, 2 hours, 0 minutes, 0 seconds; (93600 total seconds)"
        );
        assert_eq!(ScheduledTime::daily("3:04").to_string(), "daily at 03:04:00");
    }
}
