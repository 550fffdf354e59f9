//! Reading course trees from disk and bringing the stored copy in line with them.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use walkdir::WalkDir;

use crate::core::config::Settings;
use crate::core::state::AppState;
use crate::core::time::Timestamp;
use crate::db::{Backend, TaskUpserts};
use crate::models::assignment::{Assignment, ASSIGNMENT_CONFIG_FILENAME};
use crate::models::course::{Course, COURSE_CONFIG_FILENAME};
use crate::models::tasks::TaskLimits;

/// Parse `course.json` and every `assignment.json` below it. Blocking.
pub(crate) fn read_course_dir(dir: &Path, settings: &Settings) -> anyhow::Result<Course> {
    let config_path = dir.join(COURSE_CONFIG_FILENAME);
    let raw = std::fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read course config {}", config_path.display()))?;
    let mut course: Course = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid course config {}", config_path.display()))?;

    if course.source.is_none() {
        course.source = Some(dir.to_string_lossy().to_string());
    }

    let mut assignment_paths: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == ASSIGNMENT_CONFIG_FILENAME)
        .map(|entry| entry.into_path())
        .collect();
    assignment_paths.sort();

    for path in assignment_paths {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read assignment config {}", path.display()))?;
        let mut assignment: Assignment = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid assignment config {}", path.display()))?;
        assignment.source_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

        course
            .add_assignment(assignment)
            .with_context(|| format!("Failed to add assignment from {}", path.display()))?;
    }

    course
        .validate(&settings.task_limits(), settings.grading().runtime_max_secs)
        .with_context(|| format!("Invalid course in {}", dir.display()))?;

    Ok(course)
}

/// Write the course's desired task set, keeping run times of unchanged tasks and
/// removing stored tasks the course no longer declares. Returns the number of active tasks.
pub(crate) async fn reconcile_tasks(
    backend: &dyn Backend,
    course: &Course,
    limits: &TaskLimits,
    now: Timestamp,
) -> anyhow::Result<usize> {
    let mut upserts: TaskUpserts = course.desired_tasks(limits, now)?;
    let existing = backend.get_active_tasks().await?;

    for (hash, task) in upserts.iter_mut() {
        if let (Some(task), Some(old)) = (task.as_mut(), existing.get(hash)) {
            task.merge_times(old);
        }
    }

    for (hash, task) in &existing {
        if task.course_id.as_deref() == Some(course.id.as_str()) && !upserts.contains_key(hash) {
            upserts.insert(hash.clone(), None);
        }
    }

    let active = upserts.values().filter(|task| task.is_some()).count();
    backend
        .upsert_active_tasks(&upserts)
        .await
        .with_context(|| format!("Failed to store tasks for course '{}'", course.id))?;

    Ok(active)
}

/// Load a course tree, store it, schedule its tasks and build its images.
pub(crate) async fn load_course_dir(state: &AppState, dir: &Path) -> anyhow::Result<Course> {
    let settings = state.settings().clone();
    let path = dir.to_path_buf();
    let course = tokio::task::spawn_blocking(move || read_course_dir(&path, &settings))
        .await
        .context("course read task panicked")??;

    state
        .backend()
        .save_course(&course)
        .await
        .with_context(|| format!("Failed to save course '{}'", course.id))?;

    let active = reconcile_tasks(
        state.backend().as_ref(),
        &course,
        &state.settings().task_limits(),
        Timestamp::now(),
    )
    .await?;
    state.task_wakeup().notify_one();

    build_images(state, &course).await;

    tracing::info!(
        course_id = %course.id,
        assignments = course.assignments.len(),
        tasks = active,
        "Loaded course"
    );

    Ok(course)
}

/// Quick image builds for every assignment. Failures are logged, not returned.
pub(crate) async fn build_images(state: &AppState, course: &Course) {
    if !state.images().enabled() {
        return;
    }

    for assignment in course.assignments.values() {
        match state.images().build_quick(assignment).await {
            Ok(true) => tracing::info!(assignment = %assignment.full_id(), "Built assignment image"),
            Ok(false) => {}
            Err(err) => tracing::error!(
                error = %format!("{err:#}"),
                course_id = %course.id,
                assignment_id = %assignment.id,
                "Failed to build assignment image"
            ),
        }
    }
}

/// Reload a course from its source (or `source_override`). `false` when there is nowhere
/// to load it from.
pub(crate) async fn update_course(
    state: &AppState,
    course_id: &str,
    clear: bool,
    source_override: Option<&str>,
) -> anyhow::Result<bool> {
    let existing = state.backend().get_course(course_id).await?;

    let source = match source_override.map(str::trim).filter(|source| !source.is_empty()) {
        Some(source) => PathBuf::from(source),
        None => match existing.as_ref().and_then(Course::source_path) {
            Some(source) => source,
            None => {
                tracing::warn!(course_id, "Course has no source to update from");
                return Ok(false);
            }
        },
    };

    if !source.join(COURSE_CONFIG_FILENAME).is_file() {
        bail!("Course source '{}' has no {}", source.display(), COURSE_CONFIG_FILENAME);
    }

    if clear {
        state
            .backend()
            .clear_course(course_id)
            .await
            .with_context(|| format!("Failed to clear course '{course_id}'"))?;
    }

    let course = load_course_dir(state, &source).await?;
    if course.id != course_id.trim().to_lowercase() {
        bail!("Course source '{}' holds course '{}', not '{course_id}'", source.display(), course.id);
    }

    Ok(true)
}

/// Every course tree under the courses root. A broken course does not stop the others.
pub(crate) async fn load_courses_root(state: &AppState) -> anyhow::Result<Vec<String>> {
    let root = state.settings().dirs().courses_root.clone();
    if !root.is_dir() {
        tracing::debug!(root = %root.display(), "No courses root, nothing to load");
        return Ok(Vec::new());
    }

    let dirs = tokio::task::spawn_blocking(move || {
        let mut dirs: Vec<PathBuf> = WalkDir::new(&root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file() && entry.file_name() == COURSE_CONFIG_FILENAME)
            .filter_map(|entry| entry.path().parent().map(Path::to_path_buf))
            .collect();
        dirs.sort();
        dirs
    })
    .await
    .context("course scan task panicked")?;

    let mut loaded = Vec::new();
    for dir in dirs {
        match load_course_dir(state, &dir).await {
            Ok(course) => loaded.push(course.id),
            Err(err) => {
                tracing::error!(error = %format!("{err:#}"), dir = %dir.display(), "Failed to load course")
            }
        }
    }

    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use time::UtcOffset;

    use super::*;
    use crate::db::memory::MemoryBackend;
    use crate::models::scheduled_time::{DurationSpec, ScheduledTime};
    use crate::models::tasks::{TaskType, UserTaskInfo};
    use crate::test_support::{self, ASSIGNMENT_ID, COURSE_ID};

    fn limits() -> TaskLimits {
        TaskLimits { min_period_secs: 600, utc_offset: UtcOffset::UTC }
    }

    fn course_with_tasks(tasks: Vec<UserTaskInfo>) -> Course {
        let mut course = Course::new(COURSE_ID);
        course.tasks = tasks;
        course.validate(&limits(), 300).expect("valid");
        course
    }

    #[test]
    fn course_tree_is_read_with_assignments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let course_dir = test_support::write_course_fixture(dir.path());
        let settings = test_support::test_settings(dir.path());

        let course = read_course_dir(&course_dir, &settings).expect("course");
        assert_eq!(course.id, COURSE_ID);
        assert_eq!(course.source_path(), Some(course_dir.clone()));

        let assignment = course.assignment(ASSIGNMENT_ID).expect("assignment");
        assert_eq!(assignment.course_id, COURSE_ID);
        assert_eq!(assignment.source_dir, course_dir.join(ASSIGNMENT_ID));
        assert_eq!(assignment.max_runtime_secs(), settings.grading().runtime_max_secs);
    }

    #[test]
    fn broken_assignment_fails_the_course() {
        let dir = tempfile::tempdir().expect("tempdir");
        let course_dir = test_support::write_course_fixture(dir.path());
        std::fs::write(course_dir.join(ASSIGNMENT_ID).join(ASSIGNMENT_CONFIG_FILENAME), "{").expect("write");

        let settings = test_support::test_settings(dir.path());
        assert!(read_course_dir(&course_dir, &settings).is_err());
    }

    #[tokio::test]
    async fn reconciliation_is_idempotent_and_drops_stale_tasks() {
        let backend = MemoryBackend::new();
        let now = Timestamp::now();
        let backup = UserTaskInfo::new(TaskType::Backup, ScheduledTime::every(DurationSpec::from_days(1)));
        let update = UserTaskInfo::new(TaskType::CourseUpdate, ScheduledTime::daily("03:00"));

        let course = course_with_tasks(vec![backup.clone(), update]);
        assert_eq!(reconcile_tasks(&backend, &course, &limits(), now).await.expect("first"), 2);
        let first = backend.get_active_tasks().await.expect("tasks");

        reconcile_tasks(&backend, &course, &limits(), now).await.expect("second");
        assert_eq!(backend.get_active_tasks().await.expect("tasks"), first);

        let course = course_with_tasks(vec![backup]);
        assert_eq!(reconcile_tasks(&backend, &course, &limits(), now).await.expect("third"), 1);
        let tasks = backend.get_active_tasks().await.expect("tasks");
        assert_eq!(tasks.len(), 1);
        assert!(tasks.values().all(|task| task.info.kind == TaskType::Backup));
    }

    #[tokio::test]
    async fn reconciliation_keeps_run_times() {
        let backend = MemoryBackend::new();
        let now = Timestamp::now();
        let course = course_with_tasks(vec![UserTaskInfo::new(
            TaskType::Backup,
            ScheduledTime::every(DurationSpec::from_days(1)),
        )]);
        reconcile_tasks(&backend, &course, &limits(), now).await.expect("first");

        let stored = backend.get_next_active_task().await.expect("next").expect("task");
        let ran = stored.advanced(now, UtcOffset::UTC);
        assert!(backend.claim_active_task(&stored, &ran).await.expect("claim"));

        reconcile_tasks(&backend, &course, &limits(), now).await.expect("second");
        let after = backend.get_next_active_task().await.expect("next").expect("task");
        assert_eq!(after.last_run_time, now);
        assert_eq!(after.next_run_time, ran.next_run_time);
    }

    #[tokio::test]
    async fn update_course_reloads_from_source() {
        let context = test_support::test_state().await;
        let state = &context.state;

        assert!(update_course(state, COURSE_ID, false, None).await.expect("update"));
        assert!(!update_course(state, "missing", false, None).await.expect("no source"));

        let other = tempfile::tempdir().expect("tempdir");
        let result = update_course(state, COURSE_ID, false, Some(&other.path().to_string_lossy())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn update_with_clear_drops_submissions() {
        let context = test_support::test_state().await;
        let state = &context.state;
        let assignment = test_support::assignment(state).await;
        test_support::store_submission(state, &assignment, test_support::STUDENT, "100").await;

        assert!(update_course(state, COURSE_ID, true, None).await.expect("update"));
        let history = state
            .backend()
            .get_submission_history(&assignment, test_support::STUDENT)
            .await
            .expect("history");
        assert!(history.is_empty());
        assert!(state.backend().get_course(COURSE_ID).await.expect("course").is_some());
    }
}
