mod layout;
mod submissions;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::Context;
use async_trait::async_trait;

use self::layout::{
    append_line, list_dirs, read_json, read_lines, remove_dir_if_exists, write_json, Layout,
};
use crate::core::time::Timestamp;
use crate::db::{next_short_id, pick_short_id, previous_short_id, Backend, TaskUpserts};
use crate::models::analysis::{IndividualAnalysis, PairwiseAnalysis, PairwiseKey};
use crate::models::assignment::Assignment;
use crate::models::course::Course;
use crate::models::grading::{GradingInfo, GradingResult, SubmissionHistoryItem};
use crate::models::logs::{LogQuery, LogRecord, Metric};
use crate::models::tasks::FullScheduledTask;
use crate::models::user::{CourseUser, ServerUser};
use crate::models::validate_id;
use crate::services::archive::copy_dir;

type UserTable = BTreeMap<String, ServerUser>;
type TaskTable = BTreeMap<String, FullScheduledTask>;

/// JSON files under one directory, guarded by a single reader/writer lock.
///
/// File IO runs on the blocking pool. Appends to the log and metric files take a separate
/// lock so logging never waits on a long write.
pub(crate) struct DiskBackend {
    layout: Layout,
    lock: Arc<RwLock<()>>,
    append_lock: Arc<Mutex<()>>,
}

impl DiskBackend {
    pub(crate) async fn open(dir: &Path) -> anyhow::Result<Self> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking({
            let dir = dir.clone();
            move || fs::create_dir_all(&dir)
        })
        .await??;

        tracing::debug!(dir = %dir.display(), "Opened disk database");
        Ok(Self {
            layout: Layout::new(&dir),
            lock: Arc::new(RwLock::new(())),
            append_lock: Arc::new(Mutex::new(())),
        })
    }

    async fn read<T, F>(&self, work: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Layout) -> anyhow::Result<T> + Send + 'static,
    {
        let layout = self.layout.clone();
        let lock = Arc::clone(&self.lock);
        tokio::task::spawn_blocking(move || {
            let _guard = lock.read().unwrap_or_else(PoisonError::into_inner);
            work(&layout)
        })
        .await
        .context("database read panicked")?
    }

    async fn write<T, F>(&self, work: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Layout) -> anyhow::Result<T> + Send + 'static,
    {
        let layout = self.layout.clone();
        let lock = Arc::clone(&self.lock);
        tokio::task::spawn_blocking(move || {
            let _guard = lock.write().unwrap_or_else(PoisonError::into_inner);
            work(&layout)
        })
        .await
        .context("database write panicked")?
    }

    async fn append<T, F>(&self, work: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Layout) -> anyhow::Result<T> + Send + 'static,
    {
        let layout = self.layout.clone();
        let lock = Arc::clone(&self.append_lock);
        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            work(&layout)
        })
        .await
        .context("database append panicked")?
    }
}

fn load_course(layout: &Layout, course_id: &str) -> anyhow::Result<Option<Course>> {
    let Some(mut course) = read_json::<Course>(&layout.course_file(course_id)?)? else {
        return Ok(None);
    };

    for assignment_id in list_dirs(&layout.assignments_dir(course_id)?)? {
        let path = layout.assignment_file(course_id, &assignment_id)?;
        if let Some(assignment) = read_json::<Assignment>(&path)? {
            course.assignments.insert(assignment.id.clone(), assignment);
        }
    }

    Ok(Some(course))
}

fn load_users(layout: &Layout) -> anyhow::Result<UserTable> {
    Ok(read_json(&layout.users_file())?.unwrap_or_default())
}

fn load_tasks(layout: &Layout) -> anyhow::Result<TaskTable> {
    Ok(read_json(&layout.tasks_file())?.unwrap_or_default())
}

fn assignment_key(assignment: &Assignment) -> (String, String) {
    (assignment.course_id.clone(), assignment.id.clone())
}

fn submission_dir(
    layout: &Layout,
    (course_id, assignment_id): &(String, String),
    email: &str,
    short_id: Option<&str>,
) -> anyhow::Result<Option<PathBuf>> {
    let user_dir = layout.user_submissions_dir(course_id, assignment_id, email)?;
    let ids = submissions::short_ids(&user_dir)?;
    Ok(pick_short_id(&ids, short_id).map(|id| user_dir.join(id)))
}

#[async_trait]
impl Backend for DiskBackend {
    fn name(&self) -> &'static str {
        "disk"
    }

    async fn close(&self) -> anyhow::Result<()> {
        // Wait out in-flight writers.
        self.write(|_| Ok(())).await
    }

    async fn get_course(&self, course_id: &str) -> anyhow::Result<Option<Course>> {
        let course_id = validate_id(course_id)?;
        self.read(move |layout| load_course(layout, &course_id)).await
    }

    async fn get_courses(&self) -> anyhow::Result<BTreeMap<String, Course>> {
        self.read(|layout| {
            let mut courses = BTreeMap::new();
            for course_id in list_dirs(&layout.courses_dir())? {
                if let Some(course) = load_course(layout, &course_id)? {
                    courses.insert(course.id.clone(), course);
                }
            }
            Ok(courses)
        })
        .await
    }

    async fn save_course(&self, course: &Course) -> anyhow::Result<()> {
        let course = course.clone();
        self.write(move |layout| {
            write_json(&layout.course_file(&course.id)?, &course)?;

            for assignment in course.assignments.values() {
                write_json(&layout.assignment_file(&course.id, &assignment.id)?, assignment)?;
            }

            for stale in list_dirs(&layout.assignments_dir(&course.id)?)? {
                if !course.assignments.contains_key(&stale) {
                    remove_dir_if_exists(&layout.assignments_dir(&course.id)?.join(stale))?;
                }
            }

            Ok(())
        })
        .await
        .context("failed to save course")
    }

    async fn clear_course(&self, course_id: &str) -> anyhow::Result<()> {
        let course_id = validate_id(course_id)?;
        self.write(move |layout| {
            remove_dir_if_exists(&layout.course_dir(&course_id)?)?;

            let mut tasks = load_tasks(layout)?;
            let before = tasks.len();
            tasks.retain(|_, task| task.course_id.as_deref() != Some(course_id.as_str()));
            if tasks.len() != before {
                write_json(&layout.tasks_file(), &tasks)?;
            }

            let mut users = load_users(layout)?;
            let mut changed = false;
            for user in users.values_mut() {
                changed |= user.course_info.remove(&course_id).is_some();
            }
            if changed {
                write_json(&layout.users_file(), &users)?;
            }

            for name in fs::read_dir(layout.analysis_dir()).into_iter().flatten().flatten() {
                let path = name.path();
                if let Some(record) = read_json::<IndividualAnalysis>(&path)? {
                    if record.course_id == course_id {
                        fs::remove_file(&path)?;
                    }
                }
            }

            for name in fs::read_dir(layout.pairwise_dir()).into_iter().flatten().flatten() {
                let path = name.path();
                if let Some(record) = read_json::<PairwiseAnalysis>(&path)? {
                    if record.submission_ids.course() == course_id {
                        fs::remove_file(&path)?;
                    }
                }
            }

            Ok(())
        })
        .await
    }

    async fn dump_course(&self, course_id: &str, target_dir: &Path) -> anyhow::Result<()> {
        let course_id = validate_id(course_id)?;
        let target_dir = target_dir.to_path_buf();
        self.read(move |layout| {
            let dir = layout.course_dir(&course_id)?;
            if !dir.exists() {
                anyhow::bail!("unknown course '{course_id}'");
            }
            copy_dir(&dir, &target_dir)
        })
        .await
    }

    async fn get_server_users(&self) -> anyhow::Result<BTreeMap<String, ServerUser>> {
        self.read(load_users).await
    }

    async fn get_server_user(&self, email: &str) -> anyhow::Result<Option<ServerUser>> {
        let email = email.trim().to_lowercase();
        self.read(move |layout| Ok(load_users(layout)?.remove(&email))).await
    }

    async fn get_course_users(&self, course_id: &str) -> anyhow::Result<BTreeMap<String, CourseUser>> {
        let course_id = validate_id(course_id)?;
        let users = self.read(load_users).await?;
        Ok(users
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

        self.write(move |layout| {
            let mut table = load_users(layout)?;
            for user in validated {
                table.insert(user.email.clone(), user);
            }
            write_json(&layout.users_file(), &table)
        })
        .await
        .context("failed to save users")
    }

    async fn delete_user(&self, email: &str) -> anyhow::Result<bool> {
        let email = email.trim().to_lowercase();
        self.write(move |layout| {
            let mut table = load_users(layout)?;
            let existed = table.remove(&email).is_some();
            if existed {
                write_json(&layout.users_file(), &table)?;
            }
            Ok(existed)
        })
        .await
    }

    async fn remove_user_from_course(&self, course_id: &str, email: &str) -> anyhow::Result<bool> {
        let course_id = validate_id(course_id)?;
        let email = email.trim().to_lowercase();
        self.write(move |layout| {
            let mut table = load_users(layout)?;
            let removed = table
                .get_mut(&email)
                .is_some_and(|user| user.course_info.remove(&course_id).is_some());
            if removed {
                write_json(&layout.users_file(), &table)?;
            }
            Ok(removed)
        })
        .await
    }

    async fn delete_user_token(&self, email: &str, token_id: &str) -> anyhow::Result<bool> {
        let email = email.trim().to_lowercase();
        let token_id = token_id.to_string();
        self.write(move |layout| {
            let mut table = load_users(layout)?;
            let found = table.get_mut(&email).is_some_and(|user| user.remove_token(&token_id));
            if found {
                write_json(&layout.users_file(), &table)?;
            }
            Ok(found)
        })
        .await
    }

    async fn get_next_submission_id(&self, assignment: &Assignment, email: &str) -> anyhow::Result<String> {
        let key = assignment_key(assignment);
        let email = email.to_string();
        self.read(move |layout| {
            let user_dir = layout.user_submissions_dir(&key.0, &key.1, &email)?;
            // Directories without a result still hold the id.
            let taken = list_dirs(&user_dir)?;
            Ok(next_short_id(Timestamp::now(), taken.iter().map(String::as_str)))
        })
        .await
    }

    async fn get_previous_submission_id(
        &self,
        assignment: &Assignment,
        email: &str,
        short_id: &str,
    ) -> anyhow::Result<Option<String>> {
        let key = assignment_key(assignment);
        let email = email.to_string();
        let short_id = short_id.to_string();
        self.read(move |layout| {
            let user_dir = layout.user_submissions_dir(&key.0, &key.1, &email)?;
            Ok(previous_short_id(&submissions::short_ids(&user_dir)?, &short_id))
        })
        .await
    }

    async fn save_submissions(&self, course_id: &str, results: &[GradingResult]) -> anyhow::Result<()> {
        let course_id = validate_id(course_id)?;
        let results = results.to_vec();
        self.write(move |layout| {
            for result in &results {
                let Some(info) = &result.info else {
                    anyhow::bail!("cannot save a submission without grading info");
                };

                let dir = layout
                    .user_submissions_dir(&course_id, &info.assignment_id, &info.user)?
                    .join(validate_id(&info.short_id)?);
                submissions::write_submission(&dir, result)
                    .with_context(|| format!("failed to save submission '{}'", info.id))?;
            }
            Ok(())
        })
        .await
    }

    async fn get_submission_history(
        &self,
        assignment: &Assignment,
        email: &str,
    ) -> anyhow::Result<Vec<SubmissionHistoryItem>> {
        let key = assignment_key(assignment);
        let email = email.to_string();
        self.read(move |layout| {
            let user_dir = layout.user_submissions_dir(&key.0, &key.1, &email)?;
            let mut items = Vec::new();
            for id in submissions::short_ids(&user_dir)? {
                if let Some(info) = submissions::read_info(&user_dir.join(id))? {
                    items.push(info.to_history_item());
                }
            }
            items.sort_by_key(|item| item.grading_start_time);
            Ok(items)
        })
        .await
    }

    async fn get_submission_result(
        &self,
        assignment: &Assignment,
        email: &str,
        short_id: Option<&str>,
    ) -> anyhow::Result<Option<GradingInfo>> {
        let key = assignment_key(assignment);
        let email = email.to_string();
        let short_id = short_id.map(str::to_string);
        self.read(move |layout| match submission_dir(layout, &key, &email, short_id.as_deref())? {
            Some(dir) => submissions::read_info(&dir),
            None => Ok(None),
        })
        .await
    }

    async fn get_submission_contents(
        &self,
        assignment: &Assignment,
        email: &str,
        short_id: Option<&str>,
    ) -> anyhow::Result<Option<GradingResult>> {
        let key = assignment_key(assignment);
        let email = email.to_string();
        let short_id = short_id.map(str::to_string);
        self.read(move |layout| match submission_dir(layout, &key, &email, short_id.as_deref())? {
            Some(dir) => submissions::read_submission(&dir),
            None => Ok(None),
        })
        .await
    }

    async fn get_recent_submissions(
        &self,
        assignment: &Assignment,
        emails: &[String],
    ) -> anyhow::Result<BTreeMap<String, Option<GradingInfo>>> {
        let key = assignment_key(assignment);
        let emails = emails.to_vec();
        self.read(move |layout| {
            let mut recent = BTreeMap::new();
            for email in emails {
                let info = match submission_dir(layout, &key, &email, None)? {
                    Some(dir) => submissions::read_info(&dir)?,
                    None => None,
                };
                recent.insert(email, info);
            }
            Ok(recent)
        })
        .await
    }

    async fn remove_submission(
        &self,
        assignment: &Assignment,
        email: &str,
        short_id: Option<&str>,
    ) -> anyhow::Result<bool> {
        let key = assignment_key(assignment);
        let email = email.to_string();
        let short_id = short_id.map(str::to_string);
        self.write(move |layout| match submission_dir(layout, &key, &email, short_id.as_deref())? {
            Some(dir) => remove_dir_if_exists(&dir),
            None => Ok(false),
        })
        .await
    }

    async fn upsert_active_tasks(&self, tasks: &TaskUpserts) -> anyhow::Result<()> {
        let upserts = tasks.clone();
        self.write(move |layout| {
            let mut table = load_tasks(layout)?;
            for (hash, task) in upserts {
                match task {
                    Some(task) => {
                        table.insert(hash, task);
                    }
                    None => {
                        table.remove(&hash);
                    }
                }
            }
            write_json(&layout.tasks_file(), &table)
        })
        .await
        .context("failed to save active tasks")
    }

    async fn get_active_tasks(&self) -> anyhow::Result<BTreeMap<String, FullScheduledTask>> {
        self.read(load_tasks).await
    }

    async fn get_next_active_task(&self) -> anyhow::Result<Option<FullScheduledTask>> {
        self.read(|layout| {
            Ok(load_tasks(layout)?.into_values().min_by_key(|task| task.next_run_time))
        })
        .await
    }

    async fn claim_active_task(
        &self,
        expected: &FullScheduledTask,
        advanced: &FullScheduledTask,
    ) -> anyhow::Result<bool> {
        let expected = expected.clone();
        let advanced = advanced.clone();
        self.write(move |layout| {
            let mut table = load_tasks(layout)?;
            if table.get(&expected.hash) != Some(&expected) {
                return Ok(false);
            }

            table.insert(advanced.hash.clone(), advanced);
            write_json(&layout.tasks_file(), &table)?;
            Ok(true)
        })
        .await
    }

    async fn log_task_completion(
        &self,
        course_id: &str,
        task_id: &str,
        at: Timestamp,
    ) -> anyhow::Result<()> {
        let course_id = validate_id(course_id)?;
        let task_id = task_id.to_string();
        self.write(move |layout| {
            let path = layout.completions_file(&course_id)?;
            let mut completions: BTreeMap<String, Timestamp> = read_json(&path)?.unwrap_or_default();
            completions.insert(task_id, at);
            write_json(&path, &completions)
        })
        .await
    }

    async fn get_task_completion(&self, course_id: &str, task_id: &str) -> anyhow::Result<Option<Timestamp>> {
        let course_id = validate_id(course_id)?;
        let task_id = task_id.to_string();
        self.read(move |layout| {
            let completions: BTreeMap<String, Timestamp> =
                read_json(&layout.completions_file(&course_id)?)?.unwrap_or_default();
            Ok(completions.get(&task_id).copied())
        })
        .await
    }

    async fn get_individual_analysis(
        &self,
        full_ids: &[String],
    ) -> anyhow::Result<BTreeMap<String, IndividualAnalysis>> {
        let full_ids = full_ids.to_vec();
        self.read(move |layout| {
            let mut records = BTreeMap::new();
            for id in full_ids {
                if let Some(record) = read_json(&layout.analysis_file(&id))? {
                    records.insert(id, record);
                }
            }
            Ok(records)
        })
        .await
    }

    async fn store_individual_analysis(&self, records: &[IndividualAnalysis]) -> anyhow::Result<()> {
        let records = records.to_vec();
        self.write(move |layout| {
            for record in &records {
                write_json(&layout.analysis_file(&record.full_id), record)?;
            }
            Ok(())
        })
        .await
    }

    async fn remove_individual_analysis(&self, full_ids: &[String]) -> anyhow::Result<()> {
        let full_ids = full_ids.to_vec();
        self.write(move |layout| {
            for id in full_ids {
                match fs::remove_file(layout.analysis_file(&id)) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
            Ok(())
        })
        .await
    }

    async fn get_pairwise_analysis(
        &self,
        keys: &[PairwiseKey],
    ) -> anyhow::Result<BTreeMap<PairwiseKey, PairwiseAnalysis>> {
        let keys = keys.to_vec();
        self.read(move |layout| {
            let mut records = BTreeMap::new();
            for key in keys {
                if let Some(record) = read_json(&layout.pairwise_file(&key))? {
                    records.insert(key, record);
                }
            }
            Ok(records)
        })
        .await
    }

    async fn store_pairwise_analysis(&self, records: &[PairwiseAnalysis]) -> anyhow::Result<()> {
        let records = records.to_vec();
        self.write(move |layout| {
            for record in &records {
                write_json(&layout.pairwise_file(&record.submission_ids), record)?;
            }
            Ok(())
        })
        .await
    }

    async fn remove_pairwise_analysis(&self, keys: &[PairwiseKey]) -> anyhow::Result<()> {
        let keys = keys.to_vec();
        self.write(move |layout| {
            for key in keys {
                match fs::remove_file(layout.pairwise_file(&key)) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
            Ok(())
        })
        .await
    }

    async fn log_record(&self, record: &LogRecord) -> anyhow::Result<()> {
        let record = record.clone();
        self.append(move |layout| append_line(&layout.log_file(), &record)).await
    }

    async fn get_log_records(&self, query: &LogQuery) -> anyhow::Result<Vec<LogRecord>> {
        let query = query.clone();
        self.append(move |layout| {
            let records: Vec<LogRecord> = read_lines(&layout.log_file())?;
            Ok(records.into_iter().filter(|record| query.matches(record)).collect())
        })
        .await
    }

    async fn store_metric(&self, metric: &Metric) -> anyhow::Result<()> {
        let metric = metric.clone();
        self.append(move |layout| append_line(&layout.metrics_file(), &metric)).await
    }

    async fn get_metrics(&self, after: Timestamp) -> anyhow::Result<Vec<Metric>> {
        self.append(move |layout| {
            let metrics: Vec<Metric> = read_lines(&layout.metrics_file())?;
            Ok(metrics.into_iter().filter(|metric| metric.timestamp >= after).collect())
        })
        .await
    }
}
