use serde::{Deserialize, Serialize};

use crate::models::logs::{LogRecord, RawLogQuery};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct UpdateCourseRequest {
    pub(crate) course_id: String,
    #[serde(default)]
    pub(crate) clear: bool,
    /// Replaces the course's recorded source before updating.
    #[serde(default)]
    pub(crate) source: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct UpdateCourseResponse {
    pub(crate) course_updated: bool,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct FetchLogsRequest {
    #[serde(flatten)]
    pub(crate) query: RawLogQuery,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct FetchLogsResponse {
    pub(crate) error_messages: Vec<String>,
    pub(crate) results: Vec<LogRecord>,
}
