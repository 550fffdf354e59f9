pub(crate) mod disk;
pub(crate) mod memory;
pub(crate) mod types;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use crate::core::config::{DatabaseKind, Settings};
use crate::core::time::Timestamp;
use crate::db::types::ServerRole;
use crate::models::analysis::{IndividualAnalysis, PairwiseAnalysis, PairwiseKey};
use crate::models::assignment::Assignment;
use crate::models::course::Course;
use crate::models::grading::{GradingInfo, GradingResult, SubmissionHistoryItem};
use crate::models::logs::{LogQuery, LogRecord, Metric};
use crate::models::tasks::FullScheduledTask;
use crate::models::user::{CourseUser, ServerUser, ROOT_EMAIL};

/// Active task changes keyed by hash. `None` removes the record.
pub(crate) type TaskUpserts = BTreeMap<String, Option<FullScheduledTask>>;

/// Durable storage for everything the server knows.
///
/// Lookups of missing entities return `Ok(None)`. Ids are validated before use and every
/// write is on stable storage when the call returns.
#[async_trait]
pub(crate) trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn close(&self) -> anyhow::Result<()>;

    // Courses and assignments.

    /// The course together with all of its assignments.
    async fn get_course(&self, course_id: &str) -> anyhow::Result<Option<Course>>;
    async fn get_courses(&self) -> anyhow::Result<BTreeMap<String, Course>>;
    /// Store the course and its assignments. Assignments missing from `course` are dropped,
    /// their submissions are kept.
    async fn save_course(&self, course: &Course) -> anyhow::Result<()>;
    /// Remove the course and every record under it.
    async fn clear_course(&self, course_id: &str) -> anyhow::Result<()>;
    /// Write a self-contained copy of the course's records into `target_dir`.
    async fn dump_course(&self, course_id: &str, target_dir: &Path) -> anyhow::Result<()>;

    // Users.

    async fn get_server_users(&self) -> anyhow::Result<BTreeMap<String, ServerUser>>;
    async fn get_server_user(&self, email: &str) -> anyhow::Result<Option<ServerUser>>;
    async fn get_course_users(&self, course_id: &str) -> anyhow::Result<BTreeMap<String, CourseUser>>;
    async fn upsert_users(&self, users: &[ServerUser]) -> anyhow::Result<()>;
    async fn delete_user(&self, email: &str) -> anyhow::Result<bool>;
    async fn remove_user_from_course(&self, course_id: &str, email: &str) -> anyhow::Result<bool>;
    async fn delete_user_token(&self, email: &str, token_id: &str) -> anyhow::Result<bool>;

    // Submissions.

    /// An unused short id for this user, at least the current epoch second.
    async fn get_next_submission_id(&self, assignment: &Assignment, email: &str) -> anyhow::Result<String>;
    /// The short id just before `short_id`, if any.
    async fn get_previous_submission_id(
        &self,
        assignment: &Assignment,
        email: &str,
        short_id: &str,
    ) -> anyhow::Result<Option<String>>;
    async fn save_submissions(&self, course_id: &str, results: &[GradingResult]) -> anyhow::Result<()>;
    async fn get_submission_history(
        &self,
        assignment: &Assignment,
        email: &str,
    ) -> anyhow::Result<Vec<SubmissionHistoryItem>>;
    /// `None` for the short id means the most recent submission.
    async fn get_submission_result(
        &self,
        assignment: &Assignment,
        email: &str,
        short_id: Option<&str>,
    ) -> anyhow::Result<Option<GradingInfo>>;
    async fn get_submission_contents(
        &self,
        assignment: &Assignment,
        email: &str,
        short_id: Option<&str>,
    ) -> anyhow::Result<Option<GradingResult>>;
    /// The most recent result of each user, `None` for users without one.
    async fn get_recent_submissions(
        &self,
        assignment: &Assignment,
        emails: &[String],
    ) -> anyhow::Result<BTreeMap<String, Option<GradingInfo>>>;
    async fn remove_submission(
        &self,
        assignment: &Assignment,
        email: &str,
        short_id: Option<&str>,
    ) -> anyhow::Result<bool>;

    // Tasks.

    async fn upsert_active_tasks(&self, tasks: &TaskUpserts) -> anyhow::Result<()>;
    async fn get_active_tasks(&self) -> anyhow::Result<BTreeMap<String, FullScheduledTask>>;
    /// The record with the smallest next run time, due or not.
    async fn get_next_active_task(&self) -> anyhow::Result<Option<FullScheduledTask>>;
    /// Replace `expected` with `advanced` only if the stored record still equals `expected`.
    async fn claim_active_task(
        &self,
        expected: &FullScheduledTask,
        advanced: &FullScheduledTask,
    ) -> anyhow::Result<bool>;
    async fn log_task_completion(
        &self,
        course_id: &str,
        task_id: &str,
        at: Timestamp,
    ) -> anyhow::Result<()>;
    async fn get_task_completion(&self, course_id: &str, task_id: &str) -> anyhow::Result<Option<Timestamp>>;

    // Analysis.

    async fn get_individual_analysis(
        &self,
        full_ids: &[String],
    ) -> anyhow::Result<BTreeMap<String, IndividualAnalysis>>;
    async fn store_individual_analysis(&self, records: &[IndividualAnalysis]) -> anyhow::Result<()>;
    async fn remove_individual_analysis(&self, full_ids: &[String]) -> anyhow::Result<()>;
    async fn get_pairwise_analysis(
        &self,
        keys: &[PairwiseKey],
    ) -> anyhow::Result<BTreeMap<PairwiseKey, PairwiseAnalysis>>;
    async fn store_pairwise_analysis(&self, records: &[PairwiseAnalysis]) -> anyhow::Result<()>;
    async fn remove_pairwise_analysis(&self, keys: &[PairwiseKey]) -> anyhow::Result<()>;

    // Logs and metrics.

    async fn log_record(&self, record: &LogRecord) -> anyhow::Result<()>;
    async fn get_log_records(&self, query: &LogQuery) -> anyhow::Result<Vec<LogRecord>>;
    async fn store_metric(&self, metric: &Metric) -> anyhow::Result<()>;
    async fn get_metrics(&self, after: Timestamp) -> anyhow::Result<Vec<Metric>>;
}

pub(crate) async fn open(settings: &Settings) -> anyhow::Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match settings.database().kind {
        DatabaseKind::Disk => {
            let dir = &settings.database().disk_dir;
            Arc::new(
                disk::DiskBackend::open(dir)
                    .await
                    .with_context(|| format!("failed to open disk database at {}", dir.display()))?,
            )
        }
        DatabaseKind::Memory => Arc::new(memory::MemoryBackend::new()),
    };

    ensure_root_user(backend.as_ref()).await?;
    tracing::info!(backend = backend.name(), "Database opened");

    Ok(backend)
}

pub(crate) async fn ensure_root_user(backend: &dyn Backend) -> anyhow::Result<()> {
    if backend.get_server_user(ROOT_EMAIL).await?.is_some() {
        return Ok(());
    }

    backend
        .upsert_users(&[ServerUser::new(ROOT_EMAIL, ServerRole::Root)])
        .await
        .context("failed to create root user")
}

/// Numeric order for short ids, falling back to text for anything odd.
pub(crate) fn compare_short_ids(left: &str, right: &str) -> std::cmp::Ordering {
    match (left.parse::<i64>(), right.parse::<i64>()) {
        (Ok(left), Ok(right)) => left.cmp(&right),
        _ => left.cmp(right),
    }
}

/// The next free short id given the ones already taken.
pub(crate) fn next_short_id<'a>(now: Timestamp, taken: impl IntoIterator<Item = &'a str>) -> String {
    let taken: Vec<i64> = taken.into_iter().filter_map(|id| id.parse::<i64>().ok()).collect();
    let mut candidate = now.to_secs();
    if let Some(max) = taken.iter().max() {
        candidate = candidate.max(max + 1);
    }

    while taken.contains(&candidate) {
        candidate += 1;
    }

    candidate.to_string()
}

/// The submission `short_id` names, or the most recent one, among `ids`.
pub(crate) fn pick_short_id(ids: &[String], short_id: Option<&str>) -> Option<String> {
    match short_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => ids.iter().find(|candidate| candidate.as_str() == id).cloned(),
        None => ids.iter().max_by(|left, right| compare_short_ids(left, right)).cloned(),
    }
}

pub(crate) fn previous_short_id(ids: &[String], short_id: &str) -> Option<String> {
    ids.iter()
        .filter(|candidate| compare_short_ids(candidate, short_id).is_lt())
        .max_by(|left, right| compare_short_ids(left, right))
        .cloned()
}
