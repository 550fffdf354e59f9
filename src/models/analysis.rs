use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::time::Timestamp;
use crate::models::grading::ID_DELIM;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FileSummary {
    pub(crate) filename: String,
    pub(crate) lines: u64,
    #[serde(rename = "non-empty-lines")]
    pub(crate) non_empty_lines: u64,
    pub(crate) bytes: u64,
}

/// Per-submission code statistics, keyed by the submission's full id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct IndividualAnalysis {
    #[serde(rename = "full-id")]
    pub(crate) full_id: String,
    #[serde(rename = "short-id")]
    pub(crate) short_id: String,
    #[serde(rename = "course-id")]
    pub(crate) course_id: String,
    #[serde(rename = "assignment-id")]
    pub(crate) assignment_id: String,
    pub(crate) user: String,
    #[serde(rename = "analysis-timestamp")]
    pub(crate) analysis_timestamp: Timestamp,
    #[serde(rename = "submission-start-time")]
    pub(crate) submission_start_time: Timestamp,
    pub(crate) score: f64,
    pub(crate) files: Vec<FileSummary>,
    pub(crate) lines: u64,
    #[serde(rename = "non-empty-lines")]
    pub(crate) non_empty_lines: u64,
}

impl FileSummary {
    pub(crate) fn from_content(filename: &str, content: &[u8]) -> Self {
        let text = String::from_utf8_lossy(content);
        Self {
            filename: filename.to_string(),
            lines: text.lines().count() as u64,
            non_empty_lines: text.lines().filter(|line| !line.trim().is_empty()).count() as u64,
            bytes: content.len() as u64,
        }
    }
}

impl IndividualAnalysis {
    pub(crate) fn total_files(&mut self) {
        self.lines = self.files.iter().map(|file| file.lines).sum();
        self.non_empty_lines = self.files.iter().map(|file| file.non_empty_lines).sum();
    }
}

/// An unordered pair of distinct full submission ids, stored lower id first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub(crate) struct PairwiseKey(String, String);

impl PairwiseKey {
    pub(crate) fn new(first: &str, second: &str) -> Self {
        if first <= second {
            Self(first.to_string(), second.to_string())
        } else {
            Self(second.to_string(), first.to_string())
        }
    }

    pub(crate) fn ids(&self) -> [&str; 2] {
        [&self.0, &self.1]
    }

    /// The lower submission's course, which owns the record.
    pub(crate) fn course(&self) -> &str {
        self.0.split(ID_DELIM).next().unwrap_or_default()
    }
}

impl fmt::Display for PairwiseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}||{}", self.0, self.1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct FileSimilarity {
    pub(crate) filename: String,
    pub(crate) tool: String,
    pub(crate) version: String,
    pub(crate) score: f64,
}

/// Similarity of the files two submissions share, keyed by their pair of ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PairwiseAnalysis {
    #[serde(rename = "submission-ids")]
    pub(crate) submission_ids: PairwiseKey,
    #[serde(rename = "analysis-timestamp")]
    pub(crate) analysis_timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub(crate) failure: bool,
    #[serde(rename = "failure-message", default, skip_serializing_if = "String::is_empty")]
    pub(crate) failure_message: String,
    #[serde(default)]
    pub(crate) similarities: BTreeMap<String, Vec<FileSimilarity>>,
    /// Files only one side has, as `[lhs, rhs]` with an empty slot for the missing side.
    #[serde(rename = "unmatched-files", default)]
    pub(crate) unmatched_files: Vec<[String; 2]>,
    #[serde(rename = "mean-similarities", default)]
    pub(crate) mean_similarities: BTreeMap<String, f64>,
    #[serde(rename = "total-mean-similarity", default)]
    pub(crate) total_mean_similarity: f64,
}

impl PairwiseAnalysis {
    pub(crate) fn new(
        submission_ids: PairwiseKey,
        similarities: BTreeMap<String, Vec<FileSimilarity>>,
        unmatched_files: Vec<[String; 2]>,
    ) -> Self {
        let mean_similarities: BTreeMap<String, f64> = similarities
            .iter()
            .filter(|(_, sims)| !sims.is_empty())
            .map(|(name, sims)| (name.clone(), sims.iter().map(|sim| sim.score).sum::<f64>() / sims.len() as f64))
            .collect();
        let total_mean_similarity = if mean_similarities.is_empty() {
            0.0
        } else {
            mean_similarities.values().sum::<f64>() / mean_similarities.len() as f64
        };

        Self {
            submission_ids,
            analysis_timestamp: Timestamp::now(),
            failure: false,
            failure_message: String::new(),
            similarities,
            unmatched_files,
            mean_similarities,
            total_mean_similarity,
        }
    }

    pub(crate) fn failed(submission_ids: PairwiseKey, message: String) -> Self {
        Self {
            failure: true,
            failure_message: message,
            ..Self::new(submission_ids, BTreeMap::new(), Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_lines_are_counted_separately() {
        let summary = FileSummary::from_content("main.py", b"import os\n\n  \nprint(1)\n");
        assert_eq!(summary.lines, 4);
        assert_eq!(summary.non_empty_lines, 2);
        assert_eq!(summary.bytes, 23);
    }

    #[test]
    fn pairwise_keys_are_ordered() {
        let key = PairwiseKey::new("c::a::z@b::2", "c::a::a@b::1");
        assert_eq!(key.ids(), ["c::a::a@b::1", "c::a::z@b::2"]);
        assert_eq!(key, PairwiseKey::new("c::a::a@b::1", "c::a::z@b::2"));
    }

    #[test]
    fn means_skip_files_without_scores() {
        let sim = |score| FileSimilarity {
            filename: String::from("main.py"),
            tool: String::from("shingle"),
            version: String::from("1"),
            score,
        };
        let similarities = BTreeMap::from([
            (String::from("main.py"), vec![sim(0.5), sim(1.0)]),
            (String::from("util.py"), vec![sim(0.25)]),
            (String::from("empty.py"), Vec::new()),
        ]);

        let analysis = PairwiseAnalysis::new(PairwiseKey::new("a", "b"), similarities, Vec::new());
        assert_eq!(analysis.mean_similarities.len(), 2);
        assert_eq!(analysis.mean_similarities["main.py"], 0.75);
        assert_eq!(analysis.total_mean_similarity, 0.5);
    }
}
