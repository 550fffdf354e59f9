use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::time::Timestamp;
use crate::models::assignment::{Assignment, SubmissionLimit};
use crate::models::late::LatePolicy;
use crate::models::tasks::{FullScheduledTask, TaskLimits, UserTaskInfo};
use crate::models::{validate_id, ModelError};

pub(crate) const COURSE_CONFIG_FILENAME: &str = "course.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum LmsKind {
    Canvas,
    Test,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LmsConfig {
    #[serde(rename = "type")]
    pub(crate) kind: LmsKind,
    #[serde(rename = "course-id")]
    pub(crate) course_id: String,
    #[serde(rename = "api-token", default)]
    pub(crate) api_token: String,
    #[serde(rename = "base-url", default)]
    pub(crate) base_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Course {
    pub(crate) id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub(crate) name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) lms: Option<LmsConfig>,
    #[serde(rename = "submission-limit", default, skip_serializing_if = "Option::is_none")]
    pub(crate) submission_limit: Option<SubmissionLimit>,
    #[serde(rename = "late-policy", default, skip_serializing_if = "Option::is_none")]
    pub(crate) late_policy: Option<LatePolicy>,
    /// Local path the course can be reloaded from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) source: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) tasks: Vec<UserTaskInfo>,

    #[serde(skip)]
    pub(crate) assignments: BTreeMap<String, Assignment>,
}

impl Course {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: String::new(),
            lms: None,
            submission_limit: None,
            late_policy: None,
            source: None,
            tasks: Vec::new(),
            assignments: BTreeMap::new(),
        }
    }

    pub(crate) fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub(crate) fn assignment(&self, id: &str) -> Option<&Assignment> {
        self.assignments.get(&id.trim().to_lowercase())
    }

    pub(crate) fn source_path(&self) -> Option<PathBuf> {
        self.source.as_ref().map(PathBuf::from)
    }

    pub(crate) fn add_assignment(&mut self, mut assignment: Assignment) -> Result<(), ModelError> {
        assignment.course_id = self.id.clone();
        assignment.id = validate_id(&assignment.id)?;
        if self.assignments.contains_key(&assignment.id) {
            return Err(ModelError::InvalidId(format!(
                "duplicate assignment '{}' in course '{}'",
                assignment.id, self.id
            )));
        }

        self.assignments.insert(assignment.id.clone(), assignment);
        Ok(())
    }

    pub(crate) fn validate(
        &mut self,
        limits: &TaskLimits,
        server_max_runtime_secs: u64,
    ) -> Result<(), ModelError> {
        self.id = validate_id(&self.id)?;
        self.name = self.name.trim().to_string();

        if let Some(limit) = &self.submission_limit {
            limit.validate()?;
        }

        if let Some(policy) = &self.late_policy {
            policy.validate()?;
        }

        for task in &mut self.tasks {
            task.validate(limits)?;
        }

        let mut assignments = BTreeMap::new();
        for (_, mut assignment) in std::mem::take(&mut self.assignments) {
            assignment.course_id = self.id.clone();
            assignment.validate(
                self.submission_limit.as_ref(),
                self.late_policy.as_ref(),
                server_max_runtime_secs,
            )?;
            assignments.insert(assignment.id.clone(), assignment);
        }
        self.assignments = assignments;

        Ok(())
    }

    /// Every task this course wants scheduled, keyed by hash. Disabled tasks map to `None`.
    pub(crate) fn desired_tasks(
        &self,
        limits: &TaskLimits,
        now: Timestamp,
    ) -> Result<BTreeMap<String, Option<FullScheduledTask>>, ModelError> {
        let mut tasks = BTreeMap::new();
        for info in &self.tasks {
            if info.disabled {
                // The hash an enabled copy would have, so a stored record gets removed.
                let mut enabled = info.clone();
                enabled.disabled = false;
                if let Ok(Some(task)) = enabled.to_full_course_task(&self.id, limits, now) {
                    tasks.insert(task.hash, None);
                }
                continue;
            }

            if let Some(task) = info.to_full_course_task(&self.id, limits, now)? {
                tasks.insert(task.hash.clone(), Some(task));
            }
        }

        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use time::UtcOffset;

    use super::*;
    use crate::models::image::ImageInfo;
    use crate::models::scheduled_time::{DurationSpec, ScheduledTime};
    use crate::models::tasks::TaskType;

    fn limits() -> TaskLimits {
        TaskLimits { min_period_secs: 600, utc_offset: UtcOffset::UTC }
    }

    fn course() -> Course {
        let mut course = Course::new("Course101");
        course.submission_limit = Some(SubmissionLimit { max: Some(2), window: None });
        course
            .add_assignment(Assignment::new(
                "",
                "hw0",
                ImageInfo { invocation: vec![String::from("./grade.sh")], ..ImageInfo::default() },
            ))
            .expect("add");
        course
    }

    #[test]
    fn validate_propagates_course_settings() {
        let mut course = course();
        course.validate(&limits(), 300).expect("valid");

        let assignment = course.assignment("HW0").expect("assignment");
        assert_eq!(assignment.course_id, "course101");
        assert_eq!(assignment.submission_limit, course.submission_limit);
    }

    #[test]
    fn duplicate_assignments_are_rejected() {
        let mut course = course();
        let duplicate = course.assignment("hw0").cloned().expect("assignment");
        assert!(course.add_assignment(duplicate).is_err());
    }

    #[test]
    fn disabled_tasks_become_removals() {
        let mut course = course();
        let every = ScheduledTime::every(DurationSpec::from_days(1));
        course.tasks.push(UserTaskInfo::new(TaskType::Backup, every.clone()));
        course.tasks.push(UserTaskInfo {
            disabled: true,
            ..UserTaskInfo::new(TaskType::CourseUpdate, every)
        });
        course.validate(&limits(), 300).expect("valid");

        let desired = course.desired_tasks(&limits(), Timestamp::now()).expect("tasks");
        assert_eq!(desired.len(), 2);
        assert_eq!(desired.values().filter(|task| task.is_some()).count(), 1);
        assert_eq!(desired.values().filter(|task| task.is_none()).count(), 1);
    }

    #[test]
    fn reconciliation_is_idempotent() {
        let mut course = course();
        course.tasks.push(UserTaskInfo::new(
            TaskType::Backup,
            ScheduledTime::every(DurationSpec::from_days(1)),
        ));
        course.validate(&limits(), 300).expect("valid");

        let now = Timestamp::now();
        let first = course.desired_tasks(&limits(), now).expect("tasks");
        let second = course.desired_tasks(&limits(), now).expect("tasks");
        assert_eq!(first, second);
    }
}
