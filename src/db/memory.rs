use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Context;
use async_trait::async_trait;

use crate::core::time::Timestamp;
use crate::db::{
    compare_short_ids, next_short_id, pick_short_id, previous_short_id, Backend, TaskUpserts,
};
use crate::models::analysis::{IndividualAnalysis, PairwiseAnalysis, PairwiseKey};
use crate::models::assignment::Assignment;
use crate::models::course::{Course, COURSE_CONFIG_FILENAME};
use crate::models::grading::{GradingInfo, GradingResult, SubmissionHistoryItem};
use crate::models::logs::{LogQuery, LogRecord, Metric};
use crate::models::tasks::FullScheduledTask;
use crate::models::user::{CourseUser, ServerUser};
use crate::models::validate_id;

/// `(course, assignment, email)` to short id to result.
type SubmissionKey = (String, String, String);

#[derive(Default)]
struct Tables {
    courses: BTreeMap<String, Course>,
    users: BTreeMap<String, ServerUser>,
    submissions: BTreeMap<SubmissionKey, BTreeMap<String, GradingResult>>,
    tasks: BTreeMap<String, FullScheduledTask>,
    completions: BTreeMap<String, BTreeMap<String, Timestamp>>,
    analysis: BTreeMap<String, IndividualAnalysis>,
    pairwise: BTreeMap<PairwiseKey, PairwiseAnalysis>,
    logs: Vec<LogRecord>,
    metrics: Vec<Metric>,
}

/// Everything in process memory. Used for tests and throwaway servers.
#[derive(Default)]
pub(crate) struct MemoryBackend {
    tables: RwLock<Tables>,
}

impl MemoryBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn submission_key(assignment: &Assignment, email: &str) -> anyhow::Result<SubmissionKey> {
    Ok((
        validate_id(&assignment.course_id)?,
        validate_id(&assignment.id)?,
        email.trim().to_lowercase(),
    ))
}

fn sorted_ids(results: &BTreeMap<String, GradingResult>) -> Vec<String> {
    let mut ids: Vec<String> = results.keys().cloned().collect();
    ids.sort_by(|left, right| compare_short_ids(left, right));
    ids
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_course(&self, course_id: &str) -> anyhow::Result<Option<Course>> {
        let course_id = validate_id(course_id)?;
        Ok(self.read().courses.get(&course_id).cloned())
    }

    async fn get_courses(&self) -> anyhow::Result<BTreeMap<String, Course>> {
        Ok(self.read().courses.clone())
    }

    async fn save_course(&self, course: &Course) -> anyhow::Result<()> {
        let course_id = validate_id(&course.id)?;
        self.write().courses.insert(course_id, course.clone());
        Ok(())
    }

    async fn clear_course(&self, course_id: &str) -> anyhow::Result<()> {
        let course_id = validate_id(course_id)?;
        let mut tables = self.write();

        tables.courses.remove(&course_id);
        tables.submissions.retain(|(course, _, _), _| course != &course_id);
        tables.completions.remove(&course_id);
        tables.tasks.retain(|_, task| task.course_id.as_deref() != Some(course_id.as_str()));
        tables.analysis.retain(|_, record| record.course_id != course_id);
        tables.pairwise.retain(|key, _| key.course() != course_id);
        for user in tables.users.values_mut() {
            user.course_info.remove(&course_id);
        }

        Ok(())
    }

    async fn dump_course(&self, course_id: &str, target_dir: &Path) -> anyhow::Result<()> {
        let course_id = validate_id(course_id)?;
        let (course, submissions) = {
            let tables = self.read();
            let Some(course) = tables.courses.get(&course_id).cloned() else {
                anyhow::bail!("unknown course '{course_id}'");
            };
            let submissions: Vec<(SubmissionKey, BTreeMap<String, GradingResult>)> = tables
                .submissions
                .iter()
                .filter(|((course, _, _), _)| course == &course_id)
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            (course, submissions)
        };

        fs::create_dir_all(target_dir)?;
        fs::write(target_dir.join(COURSE_CONFIG_FILENAME), serde_json::to_vec_pretty(&course)?)?;
        for (id, assignment) in &course.assignments {
            let dir = target_dir.join("assignments").join(id);
            fs::create_dir_all(&dir)?;
            fs::write(dir.join("assignment.json"), serde_json::to_vec_pretty(assignment)?)?;
        }

        for ((_, assignment_id, email), results) in submissions {
            let dir = target_dir.join("submissions").join(assignment_id).join(email);
            fs::create_dir_all(&dir)?;
            for (short_id, result) in results {
                fs::write(dir.join(format!("{short_id}.json")), serde_json::to_vec(&result)?)
                    .context("failed to dump submission")?;
            }
        }

        Ok(())
    }

    async fn get_server_users(&self) -> anyhow::Result<BTreeMap<String, ServerUser>> {
        Ok(self.read().users.clone())
    }

    async fn get_server_user(&self, email: &str) -> anyhow::Result<Option<ServerUser>> {
        Ok(self.read().users.get(&email.trim().to_lowercase()).cloned())
    }

    async fn get_course_users(&self, course_id: &str) -> anyhow::Result<BTreeMap<String, CourseUser>> {
        let course_id = validate_id(course_id)?;
        Ok(self
            .read()
            .users
            .values()
            .filter_map(|user| user.to_course_user(&course_id))
            .map(|user| (user.email.clone(), user))
            .collect())
    }

    async fn upsert_users(&self, users: &[ServerUser]) -> anyhow::Result<()> {
        let mut validated = Vec::with_capacity(users.len());
        for user in users {
            let mut user = user.clone();
            user.validate()?;
            validated.push(user);
        }

        let mut tables = self.write();
        for user in validated {
            tables.users.insert(user.email.clone(), user);
        }
        Ok(())
    }

    async fn delete_user(&self, email: &str) -> anyhow::Result<bool> {
        Ok(self.write().users.remove(&email.trim().to_lowercase()).is_some())
    }

    async fn remove_user_from_course(&self, course_id: &str, email: &str) -> anyhow::Result<bool> {
        let course_id = validate_id(course_id)?;
        let mut tables = self.write();
        Ok(tables
            .users
            .get_mut(&email.trim().to_lowercase())
            .is_some_and(|user| user.course_info.remove(&course_id).is_some()))
    }

    async fn delete_user_token(&self, email: &str, token_id: &str) -> anyhow::Result<bool> {
        let mut tables = self.write();
        Ok(tables
            .users
            .get_mut(&email.trim().to_lowercase())
            .is_some_and(|user| user.remove_token(token_id)))
    }

    async fn get_next_submission_id(&self, assignment: &Assignment, email: &str) -> anyhow::Result<String> {
        let key = submission_key(assignment, email)?;
        let tables = self.read();
        let taken = tables.submissions.get(&key);
        Ok(next_short_id(
            Timestamp::now(),
            taken.into_iter().flat_map(|results| results.keys().map(String::as_str)),
        ))
    }

    async fn get_previous_submission_id(
        &self,
        assignment: &Assignment,
        email: &str,
        short_id: &str,
    ) -> anyhow::Result<Option<String>> {
        let key = submission_key(assignment, email)?;
        let tables = self.read();
        Ok(tables
            .submissions
            .get(&key)
            .and_then(|results| previous_short_id(&sorted_ids(results), short_id)))
    }

    async fn save_submissions(&self, course_id: &str, results: &[GradingResult]) -> anyhow::Result<()> {
        let course_id = validate_id(course_id)?;
        let mut tables = self.write();
        for result in results {
            let Some(info) = &result.info else {
                anyhow::bail!("cannot save a submission without grading info");
            };

            let key = (course_id.clone(), validate_id(&info.assignment_id)?, info.user.trim().to_lowercase());
            tables.submissions.entry(key).or_default().insert(info.short_id.clone(), result.clone());
        }
        Ok(())
    }

    async fn get_submission_history(
        &self,
        assignment: &Assignment,
        email: &str,
    ) -> anyhow::Result<Vec<SubmissionHistoryItem>> {
        let key = submission_key(assignment, email)?;
        let tables = self.read();
        let mut items: Vec<SubmissionHistoryItem> = tables
            .submissions
            .get(&key)
            .into_iter()
            .flat_map(|results| results.values())
            .filter_map(|result| result.info.as_ref().map(GradingInfo::to_history_item))
            .collect();
        items.sort_by_key(|item| item.grading_start_time);
        Ok(items)
    }

    async fn get_submission_result(
        &self,
        assignment: &Assignment,
        email: &str,
        short_id: Option<&str>,
    ) -> anyhow::Result<Option<GradingInfo>> {
        Ok(self
            .get_submission_contents(assignment, email, short_id)
            .await?
            .and_then(|result| result.info))
    }

    async fn get_submission_contents(
        &self,
        assignment: &Assignment,
        email: &str,
        short_id: Option<&str>,
    ) -> anyhow::Result<Option<GradingResult>> {
        let key = submission_key(assignment, email)?;
        let tables = self.read();
        let Some(results) = tables.submissions.get(&key) else {
            return Ok(None);
        };

        Ok(pick_short_id(&sorted_ids(results), short_id).and_then(|id| results.get(&id).cloned()))
    }

    async fn get_recent_submissions(
        &self,
        assignment: &Assignment,
        emails: &[String],
    ) -> anyhow::Result<BTreeMap<String, Option<GradingInfo>>> {
        let mut recent = BTreeMap::new();
        for email in emails {
            recent.insert(email.clone(), self.get_submission_result(assignment, email, None).await?);
        }
        Ok(recent)
    }

    async fn remove_submission(
        &self,
        assignment: &Assignment,
        email: &str,
        short_id: Option<&str>,
    ) -> anyhow::Result<bool> {
        let key = submission_key(assignment, email)?;
        let mut tables = self.write();
        let Some(results) = tables.submissions.get_mut(&key) else {
            return Ok(false);
        };

        let Some(id) = pick_short_id(&sorted_ids(results), short_id) else {
            return Ok(false);
        };
        Ok(results.remove(&id).is_some())
    }

    async fn upsert_active_tasks(&self, tasks: &TaskUpserts) -> anyhow::Result<()> {
        let mut tables = self.write();
        for (hash, task) in tasks {
            match task {
                Some(task) => {
                    tables.tasks.insert(hash.clone(), task.clone());
                }
                None => {
                    tables.tasks.remove(hash);
                }
            }
        }
        Ok(())
    }

    async fn get_active_tasks(&self) -> anyhow::Result<BTreeMap<String, FullScheduledTask>> {
        Ok(self.read().tasks.clone())
    }

    async fn get_next_active_task(&self) -> anyhow::Result<Option<FullScheduledTask>> {
        Ok(self.read().tasks.values().min_by_key(|task| task.next_run_time).cloned())
    }

    async fn claim_active_task(
        &self,
        expected: &FullScheduledTask,
        advanced: &FullScheduledTask,
    ) -> anyhow::Result<bool> {
        let mut tables = self.write();
        if tables.tasks.get(&expected.hash) != Some(expected) {
            return Ok(false);
        }

        tables.tasks.insert(advanced.hash.clone(), advanced.clone());
        Ok(true)
    }

    async fn log_task_completion(
        &self,
        course_id: &str,
        task_id: &str,
        at: Timestamp,
    ) -> anyhow::Result<()> {
        let course_id = validate_id(course_id)?;
        self.write().completions.entry(course_id).or_default().insert(task_id.to_string(), at);
        Ok(())
    }

    async fn get_task_completion(&self, course_id: &str, task_id: &str) -> anyhow::Result<Option<Timestamp>> {
        let course_id = validate_id(course_id)?;
        Ok(self.read().completions.get(&course_id).and_then(|tasks| tasks.get(task_id)).copied())
    }

    async fn get_individual_analysis(
        &self,
        full_ids: &[String],
    ) -> anyhow::Result<BTreeMap<String, IndividualAnalysis>> {
        let tables = self.read();
        Ok(full_ids
            .iter()
            .filter_map(|id| tables.analysis.get(id).map(|record| (id.clone(), record.clone())))
            .collect())
    }

    async fn store_individual_analysis(&self, records: &[IndividualAnalysis]) -> anyhow::Result<()> {
        let mut tables = self.write();
        for record in records {
            tables.analysis.insert(record.full_id.clone(), record.clone());
        }
        Ok(())
    }

    async fn remove_individual_analysis(&self, full_ids: &[String]) -> anyhow::Result<()> {
        let mut tables = self.write();
        for id in full_ids {
            tables.analysis.remove(id);
        }
        Ok(())
    }

    async fn get_pairwise_analysis(
        &self,
        keys: &[PairwiseKey],
    ) -> anyhow::Result<BTreeMap<PairwiseKey, PairwiseAnalysis>> {
        let tables = self.read();
        Ok(keys
            .iter()
            .filter_map(|key| tables.pairwise.get(key).map(|record| (key.clone(), record.clone())))
            .collect())
    }

    async fn store_pairwise_analysis(&self, records: &[PairwiseAnalysis]) -> anyhow::Result<()> {
        let mut tables = self.write();
        for record in records {
            tables.pairwise.insert(record.submission_ids.clone(), record.clone());
        }
        Ok(())
    }

    async fn remove_pairwise_analysis(&self, keys: &[PairwiseKey]) -> anyhow::Result<()> {
        let mut tables = self.write();
        for key in keys {
            tables.pairwise.remove(key);
        }
        Ok(())
    }

    async fn log_record(&self, record: &LogRecord) -> anyhow::Result<()> {
        self.write().logs.push(record.clone());
        Ok(())
    }

    async fn get_log_records(&self, query: &LogQuery) -> anyhow::Result<Vec<LogRecord>> {
        Ok(self.read().logs.iter().filter(|record| query.matches(record)).cloned().collect())
    }

    async fn store_metric(&self, metric: &Metric) -> anyhow::Result<()> {
        self.write().metrics.push(metric.clone());
        Ok(())
    }

    async fn get_metrics(&self, after: Timestamp) -> anyhow::Result<Vec<Metric>> {
        Ok(self.read().metrics.iter().filter(|metric| metric.timestamp >= after).cloned().collect())
    }
}
