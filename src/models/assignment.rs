use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::time::Timestamp;
use crate::models::grading::assignment_full_id;
use crate::models::image::ImageInfo;
use crate::models::late::LatePolicy;
use crate::models::scheduled_time::DurationSpec;
use crate::models::{validate_id, ModelError};

pub(crate) const ASSIGNMENT_CONFIG_FILENAME: &str = "assignment.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SubmissionWindow {
    #[serde(rename = "allowed-attempts")]
    pub(crate) allowed_attempts: u32,
    pub(crate) duration: DurationSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SubmissionLimit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) max: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) window: Option<SubmissionWindow>,
}

impl SubmissionLimit {
    pub(crate) fn validate(&self) -> Result<(), ModelError> {
        if let Some(window) = &self.window {
            window
                .duration
                .validate()
                .map_err(|err| ModelError::InvalidLimit(format!("window duration: {err}")))?;

            if window.duration.is_empty() {
                return Err(ModelError::InvalidLimit(String::from("window duration is empty")));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Assignment {
    pub(crate) id: String,
    #[serde(rename = "course-id", default)]
    pub(crate) course_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub(crate) name: String,
    #[serde(rename = "sort-id", default, skip_serializing_if = "String::is_empty")]
    pub(crate) sort_id: String,
    #[serde(rename = "due-date", default, skip_serializing_if = "Option::is_none")]
    pub(crate) due_date: Option<Timestamp>,
    #[serde(rename = "max-points", default)]
    pub(crate) max_points: f64,
    #[serde(rename = "lms-id", default, skip_serializing_if = "Option::is_none")]
    pub(crate) lms_id: Option<String>,
    #[serde(rename = "late-policy", default, skip_serializing_if = "Option::is_none")]
    pub(crate) late_policy: Option<LatePolicy>,
    #[serde(rename = "submission-limit", default, skip_serializing_if = "Option::is_none")]
    pub(crate) submission_limit: Option<SubmissionLimit>,
    #[serde(flatten)]
    pub(crate) image: ImageInfo,
    /// Directory holding `assignment.json` and the static files.
    #[serde(rename = "_source-dir", default)]
    pub(crate) source_dir: PathBuf,
}

impl Assignment {
    pub(crate) fn new(course_id: &str, id: &str, image: ImageInfo) -> Self {
        Self {
            id: id.to_string(),
            course_id: course_id.to_string(),
            name: String::new(),
            sort_id: String::new(),
            due_date: None,
            max_points: 0.0,
            lms_id: None,
            late_policy: None,
            submission_limit: None,
            image,
            source_dir: PathBuf::new(),
        }
    }

    pub(crate) fn full_id(&self) -> String {
        assignment_full_id(&self.course_id, &self.id)
    }

    pub(crate) fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub(crate) fn image_name(&self) -> String {
        format!("autograder.{}.{}", self.course_id, self.id).to_lowercase()
    }

    pub(crate) fn late_policy(&self) -> LatePolicy {
        self.late_policy.clone().unwrap_or_default()
    }

    pub(crate) fn max_runtime_secs(&self) -> u64 {
        self.image.max_runtime_secs
    }

    /// Normalize and fill inherited settings. Course-level limits and late policy apply
    /// when the assignment does not set its own.
    pub(crate) fn validate(
        &mut self,
        course_limit: Option<&SubmissionLimit>,
        course_late_policy: Option<&LatePolicy>,
        server_max_runtime_secs: u64,
    ) -> Result<(), ModelError> {
        self.id = validate_id(&self.id)?;
        self.course_id = validate_id(&self.course_id)?;
        self.name = self.name.trim().to_string();

        if self.max_points < 0.0 {
            return Err(ModelError::InvalidImage(format!(
                "max points cannot be negative: {}",
                self.max_points
            )));
        }

        if self.submission_limit.is_none() {
            self.submission_limit = course_limit.cloned();
        }
        if let Some(limit) = &self.submission_limit {
            limit.validate()?;
        }

        if self.late_policy.is_none() {
            self.late_policy = course_late_policy.cloned();
        }
        if let Some(policy) = &self.late_policy {
            policy.validate()?;
        }

        self.image.validate(server_max_runtime_secs)
    }
}
