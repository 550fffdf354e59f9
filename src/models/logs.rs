use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::time::{parse_duration_msecs, Timestamp};
use crate::db::types::LogLevel;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct LogRecord {
    pub(crate) level: LogLevel,
    pub(crate) message: String,
    pub(crate) timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) course: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) assignment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) user: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) attributes: BTreeMap<String, serde_json::Value>,
}

/// Where a log record came from.
#[derive(Debug, Clone, Default)]
pub(crate) struct LogContext {
    pub(crate) course: Option<String>,
    pub(crate) assignment: Option<String>,
    pub(crate) user: Option<String>,
    pub(crate) error: Option<String>,
    pub(crate) attributes: BTreeMap<String, serde_json::Value>,
}

/// A query as a caller wrote it. Every field is optional text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RawLogQuery {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub(crate) level: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub(crate) after: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub(crate) past: String,
    #[serde(rename = "target-course", default, skip_serializing_if = "String::is_empty")]
    pub(crate) course_id: String,
    #[serde(rename = "target-assignment", default, skip_serializing_if = "String::is_empty")]
    pub(crate) assignment_id: String,
    #[serde(rename = "target-email", default, skip_serializing_if = "String::is_empty")]
    pub(crate) user: String,
}

/// A conjunction of the present fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct LogQuery {
    pub(crate) level: LogLevel,
    pub(crate) after: Timestamp,
    pub(crate) course_id: Option<String>,
    pub(crate) assignment_id: Option<String>,
    pub(crate) user: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum MetricKind {
    #[serde(rename = "grading-time")]
    GradingTime,
    #[serde(rename = "task-time")]
    TaskTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Metric {
    pub(crate) timestamp: Timestamp,
    #[serde(rename = "type")]
    pub(crate) kind: MetricKind,
    pub(crate) value: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) attributes: BTreeMap<String, String>,
}

impl LogRecord {
    pub(crate) fn new(level: LogLevel, message: &str, context: LogContext) -> Self {
        Self {
            level,
            message: message.to_string(),
            timestamp: Timestamp::now(),
            error: context.error,
            course: context.course,
            assignment: context.assignment,
            user: context.user,
            attributes: context.attributes,
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:>5}] {}", self.timestamp, self.level.as_str().to_uppercase(), self.message)?;
        for (key, value) in [("course", &self.course), ("assignment", &self.assignment), ("user", &self.user)] {
            if let Some(value) = value {
                write!(f, " {key}={value}")?;
            }
        }

        if let Some(error) = &self.error {
            write!(f, " error='{error}'")?;
        }

        for (key, value) in &self.attributes {
            write!(f, " {key}={value}")?;
        }

        Ok(())
    }
}

impl LogContext {
    pub(crate) fn course(course_id: &str) -> Self {
        Self { course: Some(course_id.to_string()), ..Self::default() }
    }

    pub(crate) fn assignment(course_id: &str, assignment_id: &str) -> Self {
        Self {
            course: Some(course_id.to_string()),
            assignment: Some(assignment_id.to_string()),
            ..Self::default()
        }
    }

    pub(crate) fn with_user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    pub(crate) fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(format!("{error:#}"));
        self
    }

    pub(crate) fn with_attr(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

impl RawLogQuery {
    /// Parse against `now`. Errors are human readable and the partial query is still returned.
    pub(crate) fn parse(&self, now: Timestamp) -> (LogQuery, Vec<String>) {
        let mut errors = Vec::new();
        let mut query = LogQuery::default();

        if !self.level.trim().is_empty() {
            match self.level.parse::<LogLevel>() {
                Ok(level) => query.level = level,
                Err(err) => errors.push(format!(
                    "Could not parse 'level' component of log query ('{}'): '{err}'.",
                    self.level
                )),
            }
        }

        let mut after = Timestamp::zero();
        if !self.after.trim().is_empty() {
            match Timestamp::parse_rfc3339(&self.after) {
                Some(value) => after = value,
                None => errors.push(format!(
                    "Could not parse 'after' component of log query ('{}').",
                    self.after
                )),
            }
        }

        if !self.past.trim().is_empty() {
            match parse_duration_msecs(&self.past) {
                Some(msecs) if msecs >= 0 => {
                    let past = Timestamp::from_msecs(now.to_msecs() - msecs);
                    if past > after {
                        after = past;
                    }
                }
                Some(_) => errors.push(format!(
                    "Negative duration given for 'past' component of log query ('{}').",
                    self.past
                )),
                None => errors.push(format!(
                    "Could not parse 'past' component of log query ('{}').",
                    self.past
                )),
            }
        }
        query.after = after;

        query.course_id = non_empty(&self.course_id).map(|value| value.to_lowercase());
        query.assignment_id = non_empty(&self.assignment_id).map(|value| value.to_lowercase());
        query.user = non_empty(&self.user).map(|value| value.to_lowercase());

        if query.assignment_id.is_some() && query.course_id.is_none() {
            errors.push(String::from("Log queries with an assignment must also have a course."));
        }

        (query, errors)
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl LogQuery {
    pub(crate) fn matches(&self, record: &LogRecord) -> bool {
        if record.level < self.level || record.timestamp < self.after {
            return false;
        }

        if let Some(course) = &self.course_id {
            if record.course.as_ref() != Some(course) {
                return false;
            }
        }

        // Assignments only match within the queried course.
        if let Some(assignment) = &self.assignment_id {
            if self.course_id.is_none() || record.assignment.as_ref() != Some(assignment) {
                return false;
            }
        }

        if let Some(user) = &self.user {
            if record.user.as_ref() != Some(user) {
                return false;
            }
        }

        true
    }
}

impl fmt::Display for LogQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let after =
            if self.after.is_zero() { String::from("< all time >") } else { self.after.to_string() };
        write!(
            f,
            "Level: '{}', After: '{}', Course: '{}', Assignment: '{}', User: '{}'",
            self.level,
            after,
            self.course_id.as_deref().unwrap_or("< all courses >"),
            self.assignment_id.as_deref().unwrap_or("< all assignments >"),
            self.user.as_deref().unwrap_or("< all users >"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(level: LogLevel, course: Option<&str>, assignment: Option<&str>) -> LogRecord {
        LogRecord {
            level,
            message: String::from("hello"),
            timestamp: Timestamp::from_secs(100),
            course: course.map(str::to_string),
            assignment: assignment.map(str::to_string),
            user: Some(String::from("a@test.com")),
            ..LogRecord::default()
        }
    }

    #[test]
    fn raw_query_reports_all_errors() {
        let raw = RawLogQuery {
            level: String::from("loud"),
            after: String::from("yesterday"),
            assignment_id: String::from("hw0"),
            ..RawLogQuery::default()
        };

        let (_, errors) = raw.parse(Timestamp::now());
        assert_eq!(errors.len(), 3);
        assert!(errors[2].contains("must also have a course"));
    }

    #[test]
    fn past_and_after_take_the_later_time() {
        let now = Timestamp::from_secs(10_000);
        let raw = RawLogQuery {
            after: String::from("1970-01-01T00:00:01Z"),
            past: String::from("1h"),
            ..RawLogQuery::default()
        };

        let (query, errors) = raw.parse(now);
        assert!(errors.is_empty());
        assert_eq!(query.after, Timestamp::from_secs(10_000 - 3600));
    }

    #[test]
    fn matching_respects_level_and_context() {
        let query = LogQuery {
            level: LogLevel::Warn,
            course_id: Some(String::from("course101")),
            assignment_id: Some(String::from("hw0")),
            ..LogQuery::default()
        };

        assert!(query.matches(&record(LogLevel::Error, Some("course101"), Some("hw0"))));
        assert!(!query.matches(&record(LogLevel::Info, Some("course101"), Some("hw0"))));
        assert!(!query.matches(&record(LogLevel::Error, Some("course101"), Some("hw1"))));
        assert!(!query.matches(&record(LogLevel::Error, None, Some("hw0"))));
    }

    #[test]
    fn assignment_without_course_never_matches() {
        let query = LogQuery { assignment_id: Some(String::from("hw0")), ..LogQuery::default() };
        assert!(!query.matches(&record(LogLevel::Error, Some("course101"), Some("hw0"))));
    }
}
