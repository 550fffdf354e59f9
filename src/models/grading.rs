use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::time::Timestamp;

pub(crate) const ID_DELIM: &str = "::";

/// Name of the file a grader writes its result into, inside the output dir.
pub(crate) const RESULT_FILENAME: &str = "result.json";

pub(crate) fn assignment_full_id(course_id: &str, assignment_id: &str) -> String {
    format!("{course_id}{ID_DELIM}{assignment_id}")
}

pub(crate) fn submission_full_id(
    course_id: &str,
    assignment_id: &str,
    user: &str,
    short_id: &str,
) -> String {
    format!("{course_id}{ID_DELIM}{assignment_id}{ID_DELIM}{user}{ID_DELIM}{short_id}")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct GradedQuestion {
    pub(crate) name: String,
    pub(crate) max_points: f64,
    pub(crate) score: f64,
    #[serde(default)]
    pub(crate) message: String,
    #[serde(default)]
    pub(crate) grading_start_time: Timestamp,
    #[serde(default)]
    pub(crate) grading_end_time: Timestamp,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct GradingInfo {
    #[serde(default)]
    pub(crate) id: String,
    #[serde(rename = "short-id", default)]
    pub(crate) short_id: String,
    #[serde(rename = "course-id", default)]
    pub(crate) course_id: String,
    #[serde(rename = "assignment-id", default)]
    pub(crate) assignment_id: String,
    #[serde(default)]
    pub(crate) user: String,
    #[serde(default)]
    pub(crate) message: String,
    #[serde(default)]
    pub(crate) max_points: f64,
    #[serde(default)]
    pub(crate) score: f64,

    #[serde(default)]
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) questions: Vec<GradedQuestion>,
    #[serde(default)]
    pub(crate) grading_start_time: Timestamp,
    #[serde(default)]
    pub(crate) grading_end_time: Timestamp,

    #[serde(rename = "additional-info", default, skip_serializing_if = "Option::is_none")]
    pub(crate) additional_info: Option<serde_json::Value>,

    #[serde(rename = "proxy-user", default, skip_serializing_if = "Option::is_none")]
    pub(crate) proxy_user: Option<String>,
    #[serde(rename = "proxy-start-time", default, skip_serializing_if = "Option::is_none")]
    pub(crate) proxy_start_time: Option<Timestamp>,
    #[serde(rename = "proxy-end-time", default, skip_serializing_if = "Option::is_none")]
    pub(crate) proxy_end_time: Option<Timestamp>,
}

/// Lightweight view of a submission used in histories and limit checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct SubmissionHistoryItem {
    pub(crate) id: String,
    #[serde(rename = "short-id")]
    pub(crate) short_id: String,
    #[serde(rename = "course-id")]
    pub(crate) course_id: String,
    #[serde(rename = "assignment-id")]
    pub(crate) assignment_id: String,
    pub(crate) user: String,
    pub(crate) message: String,
    pub(crate) max_points: f64,
    pub(crate) score: f64,
    pub(crate) grading_start_time: Timestamp,
    #[serde(rename = "proxy-user", default, skip_serializing_if = "Option::is_none")]
    pub(crate) proxy_user: Option<String>,
    #[serde(rename = "proxy-start-time", default, skip_serializing_if = "Option::is_none")]
    pub(crate) proxy_start_time: Option<Timestamp>,
}

/// Everything stored for one submission. File maps go from relative path to gzipped bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct GradingResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) info: Option<GradingInfo>,
    #[serde(rename = "input-files-gzip", default, with = "gzip_files")]
    pub(crate) input_files_gzip: BTreeMap<String, Vec<u8>>,
    #[serde(rename = "output-files-gzip", default, with = "gzip_files")]
    pub(crate) output_files_gzip: BTreeMap<String, Vec<u8>>,
    #[serde(default)]
    pub(crate) stdout: String,
    #[serde(default)]
    pub(crate) stderr: String,
}

/// A submission with the grade it is expected to receive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct TestSubmission {
    #[serde(default)]
    pub(crate) ignore: bool,
    pub(crate) result: GradingInfo,
}

impl GradedQuestion {
    pub(crate) fn new(name: &str, score: f64, max_points: f64) -> Self {
        Self { name: name.to_string(), score, max_points, ..Self::default() }
    }

    pub(crate) fn equals(&self, other: &Self, check_messages: bool) -> bool {
        if self.name != other.name || self.max_points != other.max_points || self.score != other.score
        {
            return false;
        }

        !check_messages || self.message == other.message
    }

    fn report(&self) -> String {
        let mut output = format!("{}: {} / {}\n", self.name, self.score, self.max_points);
        if !self.message.is_empty() {
            for line in self.message.split('\n') {
                output.push_str(&format!("    {}\n", line.trim()));
            }
        }

        output
    }
}

impl GradingInfo {
    /// Set `score` and `max_points` from the questions.
    pub(crate) fn compute_points(&mut self) {
        self.score = self.questions.iter().map(|question| question.score).sum();
        self.max_points = self.questions.iter().map(|question| question.max_points).sum();
    }

    pub(crate) fn is_proxy(&self) -> bool {
        self.proxy_user.as_deref().is_some_and(|user| !user.is_empty())
    }

    /// Compare what a grader produced, ignoring ids and times.
    pub(crate) fn equals(&self, other: &Self, check_messages: bool) -> bool {
        if self.name != other.name || self.questions.len() != other.questions.len() {
            return false;
        }

        self.questions
            .iter()
            .zip(&other.questions)
            .all(|(left, right)| left.equals(right, check_messages))
    }

    pub(crate) fn report(&self) -> String {
        let mut output = format!("Autograder transcript for assignment: {}.\n", self.name);
        output.push_str(&format!(
            "Grading started at {} and ended at {}.\n",
            self.grading_start_time, self.grading_end_time
        ));

        let mut total = 0.0;
        let mut max = 0.0;
        for question in &self.questions {
            total += question.score;
            max += question.max_points;
            output.push_str(&question.report());
        }

        output.push('\n');
        output.push_str(&format!("Total: {total} / {max}"));
        output
    }

    pub(crate) fn to_history_item(&self) -> SubmissionHistoryItem {
        SubmissionHistoryItem {
            id: self.id.clone(),
            short_id: self.short_id.clone(),
            course_id: self.course_id.clone(),
            assignment_id: self.assignment_id.clone(),
            user: self.user.clone(),
            message: self.message.clone(),
            max_points: self.max_points,
            score: self.score,
            grading_start_time: self.grading_start_time,
            proxy_user: self.proxy_user.clone(),
            proxy_start_time: self.proxy_start_time,
        }
    }
}

impl SubmissionHistoryItem {
    pub(crate) fn is_proxy(&self) -> bool {
        self.proxy_user.as_deref().is_some_and(|user| !user.is_empty())
    }
}

impl GradingResult {
    pub(crate) fn has_text_output(&self) -> bool {
        !self.stdout.is_empty() || !self.stderr.is_empty()
    }

    pub(crate) fn combined_output(&self) -> String {
        format!(
            "--- stdout ---\n{}\n--------------\n--- stderr ---\n{}\n--------------",
            self.stdout, self.stderr
        )
    }
}

mod gzip_files {
    use std::collections::BTreeMap;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub(super) fn serialize<S>(value: &BTreeMap<String, Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded: BTreeMap<&String, String> =
            value.iter().map(|(path, bytes)| (path, STANDARD.encode(bytes))).collect();
        encoded.serialize(serializer)
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = Option::<BTreeMap<String, String>>::deserialize(deserializer)?.unwrap_or_default();
        encoded
            .into_iter()
            .map(|(path, value)| {
                STANDARD
                    .decode(value.as_bytes())
                    .map(|bytes| (path, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
