use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::UtcOffset;

use crate::core::time::Timestamp;
use crate::models::grading::ID_DELIM;
use crate::models::logs::RawLogQuery;
use crate::models::scheduled_time::ScheduledTime;
use crate::models::{validate_id, ModelError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub(crate) enum TaskType {
    #[serde(rename = "backup")]
    Backup,
    #[serde(rename = "course-update", alias = "update")]
    CourseUpdate,
    #[serde(rename = "email-logs")]
    EmailLogs,
    #[serde(rename = "report")]
    Report,
    #[serde(rename = "scoring-upload")]
    ScoringUpload,
    #[serde(rename = "regrade")]
    Regrade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum TaskSource {
    #[default]
    Course,
    System,
}

/// A task as written in a course config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct UserTaskInfo {
    #[serde(rename = "type")]
    pub(crate) kind: TaskType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub(crate) name: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub(crate) disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) when: Option<ScheduledTime>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) options: BTreeMap<String, serde_json::Value>,
}

/// A task as the engine tracks it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct FullScheduledTask {
    #[serde(flatten)]
    pub(crate) info: UserTaskInfo,
    #[serde(default)]
    pub(crate) source: TaskSource,
    #[serde(rename = "last-runtime", default)]
    pub(crate) last_run_time: Timestamp,
    #[serde(rename = "next-runtime")]
    pub(crate) next_run_time: Timestamp,
    pub(crate) hash: String,
    #[serde(rename = "course-id", default, skip_serializing_if = "Option::is_none")]
    pub(crate) course_id: Option<String>,
}

/// Settings that task validation depends on.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TaskLimits {
    pub(crate) min_period_secs: u64,
    pub(crate) utc_offset: UtcOffset,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl TaskType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            TaskType::Backup => "backup",
            TaskType::CourseUpdate => "course-update",
            TaskType::EmailLogs => "email-logs",
            TaskType::Report => "report",
            TaskType::ScoringUpload => "scoring-upload",
            TaskType::Regrade => "regrade",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl UserTaskInfo {
    pub(crate) fn new(kind: TaskType, when: ScheduledTime) -> Self {
        Self { kind, name: String::new(), disabled: false, when: Some(when), options: BTreeMap::new() }
    }

    pub(crate) fn with_option(mut self, key: &str, value: serde_json::Value) -> Self {
        self.options.insert(key.to_string(), value);
        self
    }

    /// Read an option, falling back to `default` when it is absent.
    pub(crate) fn option<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, ModelError> {
        match self.options.get(key) {
            None => Ok(default),
            Some(value) => serde_json::from_value(value.clone()).map_err(|err| {
                ModelError::InvalidTask(format!("option '{key}' is not properly formatted: {err}"))
            }),
        }
    }

    pub(crate) fn validate(&mut self, limits: &TaskLimits) -> Result<(), ModelError> {
        self.name = self.name.trim().to_string();

        match &self.when {
            None if !self.disabled => {
                return Err(ModelError::InvalidTask(String::from(
                    "scheduled time to run ('when') is not supplied and the task is not disabled",
                )));
            }
            None => {}
            Some(when) => {
                when.validate()?;

                let min_period_msecs = (limits.min_period_secs as i64).saturating_mul(1000);
                if when.period_msecs() < min_period_msecs {
                    return Err(ModelError::InvalidTask(format!(
                        "task is scheduled too often, min period (msecs): {min_period_msecs}, current period (msecs): {}",
                        when.period_msecs()
                    )));
                }
            }
        }

        match self.kind {
            TaskType::Report => self.validate_recipients(),
            TaskType::EmailLogs => {
                self.validate_recipients()?;

                let raw: RawLogQuery = self.option("query", RawLogQuery::default())?;
                let (_, errors) = raw.parse(Timestamp::now());
                if !errors.is_empty() {
                    return Err(ModelError::InvalidTask(errors.join(" ")));
                }

                let send_empty = self.options.get("send-empty").and_then(|value| value.as_bool());
                self.options
                    .insert(String::from("send-empty"), serde_json::Value::Bool(send_empty == Some(true)));
                Ok(())
            }
            TaskType::Regrade => {
                let users: Vec<String> = self.option("users", Vec::new())?;
                let assignments: Vec<String> = self.option("assignments", Vec::new())?;
                for assignment in &assignments {
                    validate_id(assignment)?;
                }
                if users.iter().all(|user| user.trim().is_empty()) && !users.is_empty() {
                    return Err(ModelError::InvalidTask(String::from("'users' has only empty entries")));
                }
                Ok(())
            }
            TaskType::Backup | TaskType::CourseUpdate | TaskType::ScoringUpload => Ok(()),
        }
    }

    fn validate_recipients(&mut self) -> Result<(), ModelError> {
        let to: Vec<String> = self.option("to", Vec::new())?;
        if !self.disabled && to.is_empty() {
            return Err(ModelError::InvalidTask(String::from(
                "task is not disabled, but no email recipients are declared in the 'to' value",
            )));
        }

        self.options.insert(String::from("to"), serde_json::json!(to));
        Ok(())
    }

    /// Sha256 over the JSON form; stable as long as the config is unchanged.
    pub(crate) fn content_hash(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(encoded))
    }

    /// Build the engine record for a course task. Disabled tasks produce nothing.
    pub(crate) fn to_full_course_task(
        &self,
        course_id: &str,
        limits: &TaskLimits,
        now: Timestamp,
    ) -> Result<Option<FullScheduledTask>, ModelError> {
        if self.disabled {
            return Ok(None);
        }

        let mut info = self.clone();
        info.validate(limits)?;
        let course_id = validate_id(course_id)?;

        let Some(when) = &info.when else {
            return Ok(None);
        };

        // Periodic tasks start from zero so they run right away, daily ones wait for their time.
        let baseline = if when.is_daily() { now } else { Timestamp::zero() };
        let next_run_time = when.compute_next(baseline, limits.utc_offset);
        let hash = format!("{course_id}{ID_DELIM}{}{ID_DELIM}{}", info.kind, info.content_hash());

        Ok(Some(FullScheduledTask {
            info,
            source: TaskSource::Course,
            last_run_time: Timestamp::zero(),
            next_run_time,
            hash,
            course_id: Some(course_id),
        }))
    }
}

impl fmt::Display for UserTaskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.name.is_empty() { String::new() } else { format!(" ({})", self.name) };
        let disabled = if self.disabled { " (disabled) " } else { " " };
        let when = self.when.as_ref().map(ToString::to_string).unwrap_or_else(|| String::from("never"));
        write!(f, "Task{name}{disabled}of type '{}' scheduled for [{when}]", self.kind)
    }
}

impl FullScheduledTask {
    pub(crate) fn is_daily(&self) -> bool {
        self.info.when.as_ref().is_some_and(ScheduledTime::is_daily)
    }

    /// Combine with the stored record of the same hash, as if `self` replaced it.
    pub(crate) fn merge_times(&mut self, old: &FullScheduledTask) {
        self.last_run_time = old.last_run_time;

        if self.is_daily() {
            self.next_run_time = self.next_run_time.min(old.next_run_time);
        } else {
            self.next_run_time = self.next_run_time.max(old.next_run_time);
        }
    }

    /// The record as it should look after a run that started at `now`.
    pub(crate) fn advanced(&self, now: Timestamp, offset: UtcOffset) -> FullScheduledTask {
        let mut next = self.clone();
        next.last_run_time = now;
        next.next_run_time = match &self.info.when {
            Some(when) => {
                let computed = when.compute_next(now, offset);
                // A daily time equal to now would fire again immediately.
                if computed <= now { when.compute_next(now.add_msecs(1), offset) } else { computed }
            }
            None => Timestamp::from_msecs(i64::MAX),
        };
        next
    }

    pub(crate) fn task_id(&self) -> &str {
        &self.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::scheduled_time::DurationSpec;

    fn limits() -> TaskLimits {
        TaskLimits { min_period_secs: 600, utc_offset: UtcOffset::UTC }
    }

    fn backup_every_day() -> UserTaskInfo {
        UserTaskInfo::new(TaskType::Backup, ScheduledTime::every(DurationSpec::from_days(1)))
    }

    #[test]
    fn hash_is_stable_and_content_keyed() {
        let now = Timestamp::now();
        let first = backup_every_day().to_full_course_task("Course101", &limits(), now).expect("ok");
        let second = backup_every_day().to_full_course_task("course101", &limits(), now).expect("ok");
        let first = first.expect("enabled");
        let second = second.expect("enabled");

        assert_eq!(first.hash, second.hash);
        assert!(first.hash.starts_with("course101::backup::"));

        let renamed = UserTaskInfo { name: String::from("nightly"), ..backup_every_day() };
        let third = renamed.to_full_course_task("course101", &limits(), now).expect("ok").expect("enabled");
        assert_ne!(first.hash, third.hash);
    }

    #[test]
    fn every_tasks_are_due_immediately() {
        let task = backup_every_day()
            .to_full_course_task("course101", &limits(), Timestamp::from_secs(1_000_000))
            .expect("ok")
            .expect("enabled");
        assert_eq!(task.next_run_time, Timestamp::from_msecs(24 * 60 * 60 * 1000));
    }

    #[test]
    fn disabled_tasks_produce_nothing() {
        let task = UserTaskInfo { disabled: true, when: None, ..backup_every_day() };
        assert!(task.to_full_course_task("course101", &limits(), Timestamp::now()).expect("ok").is_none());
    }

    #[test]
    fn too_frequent_tasks_are_rejected() {
        let mut task = UserTaskInfo::new(
            TaskType::Backup,
            ScheduledTime::every(DurationSpec { minutes: 5, ..DurationSpec::default() }),
        );
        assert!(task.validate(&limits()).is_err());
    }

    #[test]
    fn report_needs_recipients() {
        let mut task = UserTaskInfo::new(TaskType::Report, ScheduledTime::daily("08:00"));
        assert!(task.validate(&limits()).is_err());

        let mut task = task.with_option("to", serde_json::json!(["admin@test.com"]));
        task.validate(&limits()).expect("valid");
    }

    #[test]
    fn email_logs_checks_the_query() {
        let mut task = UserTaskInfo::new(TaskType::EmailLogs, ScheduledTime::daily("08:00"))
            .with_option("to", serde_json::json!(["admin@test.com"]))
            .with_option("query", serde_json::json!({"level": "loud"}));
        assert!(task.validate(&limits()).is_err());

        task.options.insert(String::from("query"), serde_json::json!({"level": "warn", "past": "24h"}));
        task.validate(&limits()).expect("valid");
        assert_eq!(task.options["send-empty"], serde_json::Value::Bool(false));
    }

    #[test]
    fn merge_prefers_later_every_and_earlier_daily() {
        let now = Timestamp::from_secs(1_000_000);
        let mut every = backup_every_day().to_full_course_task("c", &limits(), now).expect("ok").expect("on");
        let mut old = every.clone();
        old.last_run_time = Timestamp::from_secs(5);
        old.next_run_time = Timestamp::from_secs(2_000_000);
        every.merge_times(&old);
        assert_eq!(every.next_run_time, old.next_run_time);
        assert_eq!(every.last_run_time, old.last_run_time);

        let daily = UserTaskInfo::new(TaskType::Backup, ScheduledTime::daily("10:00"));
        let mut daily = daily.to_full_course_task("c", &limits(), now).expect("ok").expect("on");
        let mut old = daily.clone();
        old.next_run_time = Timestamp::from_secs(1);
        daily.merge_times(&old);
        assert_eq!(daily.next_run_time, Timestamp::from_secs(1));
    }

    #[test]
    fn advanced_moves_past_now() {
        let now = Timestamp::parse_rfc3339("2024-01-01T10:00:00Z").expect("ts");
        let daily = UserTaskInfo::new(TaskType::Backup, ScheduledTime::daily("10:00"));
        let task = daily.to_full_course_task("c", &limits(), now).expect("ok").expect("on");
        assert_eq!(task.next_run_time, now);

        let next = task.advanced(now, UtcOffset::UTC);
        assert_eq!(next.last_run_time, now);
        assert_eq!(next.next_run_time, Timestamp::parse_rfc3339("2024-01-02T10:00:00Z").expect("ts"));
    }

    #[test]
    fn task_json_uses_flat_fields() {
        let task = backup_every_day()
            .to_full_course_task("course101", &limits(), Timestamp::zero())
            .expect("ok")
            .expect("on");
        let json = serde_json::to_value(&task).expect("json");
        assert_eq!(json["type"], "backup");
        assert_eq!(json["course-id"], "course101");

        let decoded: FullScheduledTask = serde_json::from_value(json).expect("decode");
        assert_eq!(decoded, task);
    }
}
