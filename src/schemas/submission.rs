use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::time::Timestamp;
use crate::models::analysis::{IndividualAnalysis, PairwiseAnalysis};
use crate::models::grading::{GradingInfo, SubmissionHistoryItem};

/// Files travel base64 encoded, keyed by their relative path.
pub(crate) type EncodedFiles = BTreeMap<String, String>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct SubmitRequest {
    pub(crate) course_id: String,
    pub(crate) assignment_id: String,
    #[serde(default)]
    pub(crate) message: String,
    #[serde(default)]
    pub(crate) allow_late: bool,
    pub(crate) files: EncodedFiles,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct ProxySubmitRequest {
    pub(crate) course_id: String,
    pub(crate) assignment_id: String,
    pub(crate) proxy_email: String,
    #[serde(default)]
    pub(crate) proxy_time: Option<Timestamp>,
    #[serde(default)]
    pub(crate) message: String,
    pub(crate) files: EncodedFiles,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct ProxyResubmitRequest {
    pub(crate) course_id: String,
    pub(crate) assignment_id: String,
    pub(crate) proxy_email: String,
    #[serde(default)]
    pub(crate) proxy_time: Option<Timestamp>,
    /// Most recent submission when absent.
    #[serde(default)]
    pub(crate) target_submission: Option<String>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct SubmitResponse {
    pub(crate) rejected: bool,
    pub(crate) message: String,
    pub(crate) grading_success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) grading_info: Option<GradingInfo>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub(crate) stdout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub(crate) stderr: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct SubmissionLookupRequest {
    pub(crate) course_id: String,
    pub(crate) assignment_id: String,
    #[serde(default)]
    pub(crate) target_email: Option<String>,
    #[serde(default)]
    pub(crate) target_submission: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct PeekResponse {
    pub(crate) found_user: bool,
    pub(crate) found_submission: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) submission: Option<GradingInfo>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct HistoryResponse {
    pub(crate) found_user: bool,
    pub(crate) history: Vec<SubmissionHistoryItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct RemoveResponse {
    pub(crate) found_user: bool,
    pub(crate) found_submission: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct ProxyRegradeRequest {
    pub(crate) course_id: String,
    pub(crate) assignment_id: String,
    /// User references: emails, roles, `*`, each optionally negated with `-`.
    #[serde(default = "everyone")]
    pub(crate) target_users: Vec<String>,
    #[serde(default)]
    pub(crate) regrade_after: Option<Timestamp>,
    #[serde(default)]
    pub(crate) wait_for_completion: bool,
    #[serde(default)]
    pub(crate) dry_run: bool,
    #[serde(default)]
    pub(crate) overwrite_records: bool,
}

fn everyone() -> Vec<String> {
    vec![String::from("*")]
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct ProxyRegradeResponse {
    pub(crate) complete: bool,
    pub(crate) resolved_users: Vec<String>,
    pub(crate) warnings: Vec<String>,
    pub(crate) results: BTreeMap<String, Option<SubmissionHistoryItem>>,
    pub(crate) work_errors: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct AnalysisRequest {
    pub(crate) submissions: Vec<String>,
    #[serde(default)]
    pub(crate) wait_for_completion: bool,
    #[serde(default)]
    pub(crate) dry_run: bool,
    #[serde(default)]
    pub(crate) overwrite_records: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct IndividualAnalysisResponse {
    pub(crate) complete: bool,
    pub(crate) pending: usize,
    pub(crate) results: Vec<IndividualAnalysis>,
    pub(crate) work_errors: BTreeMap<String, String>,
}

/// Work errors are keyed by `lhs||rhs`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct PairwiseAnalysisResponse {
    pub(crate) complete: bool,
    pub(crate) pending: usize,
    pub(crate) results: Vec<PairwiseAnalysis>,
    pub(crate) work_errors: BTreeMap<String, String>,
}
