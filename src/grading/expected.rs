//! Submissions shipped with an assignment together with the grade they should get.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::grade::{grade, GradeOptions, GradeOutcome};
use crate::core::state::AppState;
use crate::models::assignment::Assignment;
use crate::models::grading::TestSubmission;
use crate::models::user::ROOT_EMAIL;

pub(crate) const TEST_SUBMISSION_FILENAME: &str = "test-submission.json";

/// Every `test-submission.json` under `dir`, sorted.
pub(crate) fn find_test_submissions(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == TEST_SUBMISSION_FILENAME)
        .map(|entry| entry.into_path())
        .collect();
    paths.sort();
    paths
}

pub(crate) fn load_test_submission(path: &Path) -> anyhow::Result<TestSubmission> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid test submission {}", path.display()))
}

/// Grade the submission next to `path` without storing it. `Ok(None)` when the grade
/// matches (or the case is ignored), otherwise a description of the mismatch.
pub(crate) async fn check_test_submission(
    state: &AppState,
    assignment: &Assignment,
    path: &Path,
) -> anyhow::Result<Option<String>> {
    let expected = load_test_submission(path)?;
    if expected.ignore {
        tracing::debug!(path = %path.display(), "Skipping ignored test submission");
        return Ok(None);
    }

    let dir = path.parent().with_context(|| format!("Test submission {} has no parent", path.display()))?;
    let options = GradeOptions { no_store: true, ..GradeOptions::default() };

    let outcome = grade(state, &CancellationToken::new(), assignment, dir, ROOT_EMAIL, "", &options)
        .await
        .map_err(|err| err.error)
        .with_context(|| format!("Failed to grade test submission {}", path.display()))?;

    let actual = match outcome {
        GradeOutcome::Graded(result) => result.info,
        GradeOutcome::SoftFailure { message, .. } => return Ok(Some(message)),
        GradeOutcome::Rejected(reason) => return Ok(Some(reason.to_string())),
    };

    match actual {
        Some(actual) if actual.equals(&expected.result, false) => Ok(None),
        Some(actual) => Ok(Some(format!(
            "Unexpected grade for {}: expected {} / {}, got {} / {}",
            path.display(),
            expected.result.questions.iter().map(|q| q.score).sum::<f64>(),
            expected.result.questions.iter().map(|q| q.max_points).sum::<f64>(),
            actual.score,
            actual.max_points
        ))),
        None => Ok(Some(format!("No grading info for {}", path.display()))),
    }
}

/// Check every test submission of an assignment. Returns the mismatches.
pub(crate) async fn check_assignment(state: &AppState, assignment: &Assignment) -> anyhow::Result<Vec<String>> {
    let mut failures = Vec::new();
    for path in find_test_submissions(&assignment.source_dir) {
        if let Some(failure) = check_test_submission(state, assignment, &path).await? {
            tracing::warn!(assignment = %assignment.full_id(), %failure, "Test submission mismatch");
            failures.push(failure);
        }
    }
    Ok(failures)
}
