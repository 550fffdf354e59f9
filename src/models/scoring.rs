use serde::{Deserialize, Serialize};

use crate::core::time::Timestamp;
use crate::models::grading::GradingInfo;

pub(crate) const LOCK_COMMENT: &str = "__lock__";
pub(crate) const AUTOGRADER_COMMENT_KEY: &str = "__autograder__v01__";

/// What the autograder remembers about a score it pushed to the LMS.
/// Serialized into an LMS comment so later uploads can find it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct ScoringInfo {
    #[serde(default)]
    pub(crate) id: String,
    #[serde(rename = "submission-time", default)]
    pub(crate) submission_time: Timestamp,
    #[serde(rename = "upload-time", default)]
    pub(crate) upload_time: Timestamp,
    #[serde(rename = "raw-score", default)]
    pub(crate) raw_score: f64,
    #[serde(default)]
    pub(crate) score: f64,
    #[serde(default)]
    pub(crate) lock: bool,
    #[serde(rename = "late-date-usage", default)]
    pub(crate) late_day_usage: i64,
    #[serde(rename = "num-days-late", default)]
    pub(crate) num_days_late: i64,
    #[serde(default)]
    pub(crate) reject: bool,
    #[serde(rename = "__autograder__v01__", default)]
    pub(crate) autograder_marker: i64,

    #[serde(skip)]
    pub(crate) lms_comment_id: Option<String>,
    #[serde(skip)]
    pub(crate) lms_comment_author_id: Option<String>,
}

impl ScoringInfo {
    pub(crate) fn from_grading_info(info: &GradingInfo) -> Self {
        Self {
            id: info.id.clone(),
            submission_time: info.grading_start_time,
            raw_score: info.score,
            ..Self::default()
        }
    }

    pub(crate) fn to_comment(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse a comment written by [`ScoringInfo::to_comment`].
    pub(crate) fn from_comment(text: &str) -> Option<Result<Self, serde_json::Error>> {
        if !text.contains(AUTOGRADER_COMMENT_KEY) {
            return None;
        }

        Some(serde_json::from_str(text))
    }
}

pub(crate) fn is_lock_comment(text: &str) -> bool {
    text.to_lowercase().contains(LOCK_COMMENT)
}
