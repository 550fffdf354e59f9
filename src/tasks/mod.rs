//! The scheduled task engine.
//!
//! One loop per process reads the active task with the smallest next run time. Due
//! tasks are claimed through a conditional update on the backend, so several engines
//! sharing one backend never run the same tick twice.

mod backup;
mod email_logs;
mod regrade;
mod report;
mod scoring_upload;

use std::time::{Duration, Instant};

use anyhow::Context;
use time::UtcOffset;

use crate::core::metrics::{TASK_DURATION, TASK_RUNS};
use crate::core::state::AppState;
use crate::core::telemetry;
use crate::core::time::Timestamp;
use crate::db::types::LogLevel;
use crate::models::logs::LogContext;
use crate::models::tasks::{FullScheduledTask, TaskType};
use crate::services::course_loader;

const LOCK_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    /// A task was claimed and run.
    Ran(String),
    /// Another engine claimed the task first.
    Lost,
    /// Nothing is due for this long.
    Wait(Duration),
    Empty,
}

/// Run the engine and the lock cleanup until the process shuts down.
pub(crate) async fn run(state: AppState) {
    let cleanup = tokio::spawn(lock_cleanup_loop(state.clone()));
    engine_loop(state).await;
    cleanup.abort();
}

async fn engine_loop(state: AppState) {
    let shutdown = state.shutdown().clone();
    let max_wait = Duration::from_secs(state.settings().tasks().max_wait_secs.max(1));
    tracing::info!(max_wait_secs = max_wait.as_secs(), "Task engine started");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let wait = match run_next_task(&state, Timestamp::now()).await {
            Ok(Step::Ran(_) | Step::Lost) => continue,
            Ok(Step::Wait(wait)) => wait.min(max_wait),
            Ok(Step::Empty) => max_wait,
            Err(err) => {
                tracing::error!(error = %format!("{err:#}"), "Failed to read the next task");
                max_wait
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = state.task_wakeup().notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    tracing::info!("Task engine stopped");
}

pub(crate) async fn lock_cleanup_loop(state: AppState) {
    let max_age = Duration::from_secs(state.settings().jobs().lock_stale_secs);
    let mut tick = tokio::time::interval(LOCK_CLEANUP_INTERVAL);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = state.shutdown().cancelled() => break,
            _ = tick.tick() => {
                state.locks().remove_stale(max_age);
            }
        }
    }
}

fn utc_offset(state: &AppState) -> UtcOffset {
    state.settings().task_limits().utc_offset
}

/// One engine iteration at `now`.
pub(crate) async fn run_next_task(state: &AppState, now: Timestamp) -> anyhow::Result<Step> {
    let Some(task) = state.backend().get_next_active_task().await? else {
        return Ok(Step::Empty);
    };

    if task.next_run_time > now {
        let msecs = task.next_run_time.to_msecs().saturating_sub(now.to_msecs());
        return Ok(Step::Wait(Duration::from_millis(msecs.max(0) as u64)));
    }

    let advanced = task.advanced(now, utc_offset(state));
    if !state.backend().claim_active_task(&task, &advanced).await? {
        tracing::debug!(task = %task.hash, "Task was claimed elsewhere");
        return Ok(Step::Lost);
    }

    run_claimed(state, task.clone(), now).await;
    Ok(Step::Ran(task.hash))
}

/// Run a claimed task. Failures and panics are logged, never returned.
async fn run_claimed(state: &AppState, task: FullScheduledTask, now: Timestamp) {
    let kind = task.info.kind;
    let course_id = task.course_id.clone().unwrap_or_default();
    let started = Instant::now();

    tracing::info!(course_id = %course_id, task = %task.info, "Running task");

    let handle = {
        let state = state.clone();
        let task = task.clone();
        tokio::spawn(async move { dispatch(&state, &task, now).await })
    };

    let outcome = match handle.await {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(anyhow::anyhow!("task panicked: {err}")),
        Err(err) => Err(anyhow::anyhow!("task was aborted: {err}")),
    };

    metrics::histogram!(TASK_DURATION, "type" => kind.as_str()).record(started.elapsed().as_secs_f64());

    match outcome {
        Ok(()) => {
            metrics::counter!(TASK_RUNS, "type" => kind.as_str(), "outcome" => "ok").increment(1);
            if let Err(err) = state
                .backend()
                .log_task_completion(&course_id, task.task_id(), now)
                .await
            {
                tracing::error!(error = %err, task = %task.hash, "Failed to log task completion");
            }
            tracing::info!(course_id = %course_id, task = %task.hash, "Task finished");
        }
        Err(err) => {
            metrics::counter!(TASK_RUNS, "type" => kind.as_str(), "outcome" => "error").increment(1);
            telemetry::log_record(
                state.backend().as_ref(),
                state.settings().telemetry().backend_level,
                LogLevel::Error,
                "Task failed",
                LogContext::course(&course_id)
                    .with_error(format!("{err:#}"))
                    .with_attr("task", task.hash.as_str()),
            )
            .await;
        }
    }
}

async fn dispatch(state: &AppState, task: &FullScheduledTask, now: Timestamp) -> anyhow::Result<()> {
    let course_id = task.course_id.as_deref().context("Task has no course")?;

    if task.info.kind == TaskType::CourseUpdate {
        course_loader::update_course(state, course_id, false, None).await?;
        return Ok(());
    }

    let course = state
        .backend()
        .get_course(course_id)
        .await?
        .with_context(|| format!("Unknown course '{course_id}'"))?;

    match task.info.kind {
        TaskType::Backup => backup::run(state, &course, now).await.map(|_| ()),
        TaskType::EmailLogs => email_logs::run(state, &course, &task.info, now).await.map(|_| ()),
        TaskType::Report => report::run(state, &course, &task.info).await,
        TaskType::ScoringUpload => scoring_upload::run(state, &course, now).await.map(|_| ()),
        TaskType::Regrade => regrade::run(state, &course, &task.info).await,
        TaskType::CourseUpdate => Ok(()),
    }
}
