use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::reject::{check_rejection, RejectReason};
use crate::core::config::Settings;
use crate::core::metrics::{GRADING_DURATION, GRADING_OUTCOMES};
use crate::core::state::AppState;
use crate::core::telemetry;
use crate::core::time::Timestamp;
use crate::db::types::LogLevel;
use crate::models::assignment::Assignment;
use crate::models::grading::{submission_full_id, GradingInfo, GradingResult, ID_DELIM, RESULT_FILENAME};
use crate::models::logs::{LogContext, Metric, MetricKind};
use crate::services::archive::{copy_dir, gzip_dir, GzipFileMap};
use crate::services::sandbox::{GradingDirs, RunRequest};

/// Slack on top of the assignment's runtime before the grader gives up on the runner.
const EXTRA_RUNTIME_SECS: u64 = 10;

#[derive(Debug, Clone, Default)]
pub(crate) struct GradeOptions {
    pub(crate) check_rejection: bool,
    pub(crate) allow_late: bool,
    /// Set for submissions made on someone else's behalf. Proxies are never rejected.
    pub(crate) proxy_user: Option<String>,
    pub(crate) proxy_time: Option<Timestamp>,
    pub(crate) keep_temp_dir: bool,
    pub(crate) no_store: bool,
}

impl GradeOptions {
    pub(crate) fn from_settings(settings: &Settings) -> Self {
        Self {
            check_rejection: true,
            keep_temp_dir: settings.grading().keep_build,
            no_store: settings.grading().no_store,
            ..Self::default()
        }
    }

    pub(crate) fn proxy(settings: &Settings, proxy_user: &str, proxy_time: Option<Timestamp>) -> Self {
        Self {
            check_rejection: false,
            proxy_user: Some(proxy_user.trim().to_lowercase()),
            proxy_time,
            ..Self::from_settings(settings)
        }
    }

    fn is_proxy(&self) -> bool {
        self.proxy_user.as_deref().is_some_and(|user| !user.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum GradeOutcome {
    Graded(GradingResult),
    Rejected(RejectReason),
    /// The grader timed out or was canceled. Nothing was stored.
    SoftFailure { message: String, result: GradingResult },
}

impl GradeOutcome {
    pub(crate) fn info(&self) -> Option<&GradingInfo> {
        match self {
            GradeOutcome::Graded(result) => result.info.as_ref(),
            _ => None,
        }
    }
}

/// A hard grading failure, with whatever the grader printed before it.
#[derive(Debug, Error)]
#[error("{error:#}")]
pub(crate) struct GradeError {
    pub(crate) error: anyhow::Error,
    pub(crate) partial: Option<GradingResult>,
}

impl From<anyhow::Error> for GradeError {
    fn from(error: anyhow::Error) -> Self {
        Self { error, partial: None }
    }
}

impl GradeError {
    fn with_output(error: anyhow::Error, partial: GradingResult) -> Self {
        Self { error, partial: Some(partial) }
    }
}

/// The start time a proxy submission is stamped with: the given time, otherwise now,
/// pulled back to the due date so the proxy is never late.
pub(crate) fn resolve_proxy_time(
    proxy_time: Option<Timestamp>,
    assignment: &Assignment,
    now: Timestamp,
) -> Timestamp {
    if let Some(time) = proxy_time {
        return time;
    }

    match assignment.due_date {
        Some(due_date) => now.min(due_date),
        None => now,
    }
}

pub(crate) fn timeout_message(assignment: &Assignment, server_max_secs: u64) -> String {
    format!(
        "Submission has ran for too long and was killed. Max assignment runtime is {} seconds \
         (server hard limit is {server_max_secs} seconds). Check for infinite loops/recursion and \
         consult with your instructors/TAs.",
        assignment.max_runtime_secs()
    )
}

pub(crate) const CANCELED_MESSAGE: &str = "Grading has been canceled (usually by a broken HTTP connection).";

/// Grade one submission directory for `email`.
pub(crate) async fn grade(
    state: &AppState,
    cancel: &CancellationToken,
    assignment: &Assignment,
    submission_dir: &Path,
    email: &str,
    message: &str,
    options: &GradeOptions,
) -> Result<GradeOutcome, GradeError> {
    let email = email.trim().to_lowercase();
    let context = LogContext::assignment(&assignment.course_id, &assignment.id).with_user(&email);

    let outcome = grade_inner(state, cancel, assignment, submission_dir, &email, message, options).await;

    let label = match &outcome {
        Ok(GradeOutcome::Graded(_)) => "graded",
        Ok(GradeOutcome::Rejected(_)) => "rejected",
        Ok(GradeOutcome::SoftFailure { .. }) => "soft-failure",
        Err(_) => "error",
    };
    metrics::counter!(GRADING_OUTCOMES, "outcome" => label).increment(1);

    match &outcome {
        Ok(GradeOutcome::SoftFailure { message, .. }) => {
            telemetry::log_record(
                state.backend().as_ref(),
                state.settings().telemetry().backend_level,
                LogLevel::Warn,
                "Grading did not finish",
                context.with_attr("reason", message.as_str()),
            )
            .await;
        }
        Err(err) => {
            telemetry::log_record(
                state.backend().as_ref(),
                state.settings().telemetry().backend_level,
                LogLevel::Error,
                "Failed to grade submission",
                context.with_error(format!("{:#}", err.error)),
            )
            .await;
        }
        _ => {}
    }

    outcome
}

async fn grade_inner(
    state: &AppState,
    cancel: &CancellationToken,
    assignment: &Assignment,
    submission_dir: &Path,
    email: &str,
    message: &str,
    options: &GradeOptions,
) -> Result<GradeOutcome, GradeError> {
    if options.check_rejection && !options.is_proxy() {
        let reject = check_rejection(
            state.backend().as_ref(),
            assignment,
            email,
            Timestamp::now(),
            options.allow_late,
        )
        .await
        .context("Failed to check for rejection")?;

        if let Some(reason) = reject {
            tracing::info!(
                course_id = %assignment.course_id,
                assignment_id = %assignment.id,
                user = %email,
                reason = %reason,
                "Submission rejected"
            );
            return Ok(GradeOutcome::Rejected(reason));
        }
    }

    let key = format!("{}{ID_DELIM}{}{ID_DELIM}{email}", assignment.course_id, assignment.id);

    // Taken before the lock so time spent queued behind the user's other grades shows up.
    let start = Timestamp::now();
    let _guard = state.locks().lock(&key).await;

    state
        .images()
        .build_quick(assignment)
        .await
        .with_context(|| format!("Failed to build assignment '{}' image", assignment.full_id()))?;

    let short_id = state
        .backend()
        .get_next_submission_id(assignment, email)
        .await
        .with_context(|| format!("Unable to get next submission id for '{}' user '{email}'", assignment.full_id()))?;
    let full_id = submission_full_id(&assignment.course_id, &assignment.id, email, &short_id);

    let (dirs, input_files) = prepare_dirs(&state.settings().dirs().work, submission_dir).await?;

    let mut result = GradingResult { input_files_gzip: input_files, ..GradingResult::default() };

    let run = run_grader(state, cancel, assignment, &dirs, &full_id).await;
    let end = Timestamp::now();

    let outcome = match run {
        Err(err) => Err(GradeError::with_output(err, result)),
        Ok(RunResult::Soft { message, stdout, stderr }) => {
            result.stdout = stdout;
            result.stderr = stderr;
            Ok(GradeOutcome::SoftFailure { message, result })
        }
        Ok(RunResult::Done { stdout, stderr }) => {
            result.stdout = stdout;
            result.stderr = stderr;

            match collect_output(&dirs).await {
                Err(err) => Err(GradeError::with_output(err, result)),
                Ok((mut info, output_files)) => {
                    info.id = full_id.clone();
                    info.short_id = short_id.clone();
                    info.course_id = assignment.course_id.clone();
                    info.assignment_id = assignment.id.clone();
                    info.user = email.to_string();
                    info.message = message.to_string();
                    stamp_times(&mut info, assignment, options, start, end);
                    info.compute_points();

                    result.info = Some(info);
                    result.output_files_gzip = output_files;
                    Ok(GradeOutcome::Graded(result))
                }
            }
        }
    };

    if options.keep_temp_dir {
        let path = dirs.keep();
        tracing::debug!(path = %path.display(), "Leaving behind temp grading dir");
    }

    let result = match outcome? {
        GradeOutcome::Graded(result) => result,
        other => return Ok(other),
    };

    if !options.no_store {
        if let Err(err) = state
            .backend()
            .save_submissions(&assignment.course_id, std::slice::from_ref(&result))
            .await
            .context("Failed to save grading result")
        {
            return Err(GradeError::with_output(err, result));
        }
    }

    record_metric(state, assignment, email, start, end);

    tracing::info!(
        course_id = %assignment.course_id,
        assignment_id = %assignment.id,
        user = %email,
        submission = %full_id,
        "Graded submission"
    );

    Ok(GradeOutcome::Graded(result))
}

enum RunResult {
    Done { stdout: String, stderr: String },
    Soft { message: String, stdout: String, stderr: String },
}

/// A fresh temp tree with the submission copied into its input dir, plus the
/// gzipped submission itself.
async fn prepare_dirs(work_root: &Path, submission_dir: &Path) -> anyhow::Result<(GradingDirs, GzipFileMap)> {
    let work_root = work_root.to_path_buf();
    let submission_dir: PathBuf = submission_dir.to_path_buf();

    tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        if !submission_dir.is_dir() {
            bail!("Submission dir '{}' does not exist", submission_dir.display());
        }

        let input_files = gzip_dir(&submission_dir)
            .with_context(|| format!("Failed to copy submission input '{}'", submission_dir.display()))?;
        let dirs = GradingDirs::create(&work_root, "autograder-grading-")
            .context("Failed to create temp grading dir")?;
        copy_dir(&submission_dir, &dirs.input).context("Failed to copy over submission contents")?;

        Ok((dirs, input_files))
    })
    .await
    .context("grading prep task panicked")?
}

async fn run_grader(
    state: &AppState,
    cancel: &CancellationToken,
    assignment: &Assignment,
    dirs: &GradingDirs,
    full_id: &str,
) -> anyhow::Result<RunResult> {
    let server_max_secs = state.settings().grading().runtime_max_secs;
    let max_secs = assignment.max_runtime_secs();
    let image_name = assignment.image_name();
    let request = RunRequest { assignment, image_name: &image_name, dirs, full_id, max_secs };

    // The runner enforces max_secs itself. This only catches a runner that hangs.
    let limit = Duration::from_secs(max_secs.max(1) + EXTRA_RUNTIME_SECS);
    let output = match tokio::time::timeout(limit, state.runner().run(cancel, &request)).await {
        Ok(output) => output.with_context(|| {
            format!("Failed to run {} grader for '{}'", state.runner().name(), assignment.full_id())
        })?,
        Err(_) => {
            return Ok(RunResult::Soft {
                message: timeout_message(assignment, server_max_secs),
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    };

    if output.timed_out {
        return Ok(RunResult::Soft {
            message: timeout_message(assignment, server_max_secs),
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }

    if output.canceled {
        return Ok(RunResult::Soft {
            message: CANCELED_MESSAGE.to_string(),
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }

    Ok(RunResult::Done { stdout: output.stdout, stderr: output.stderr })
}

async fn collect_output(dirs: &GradingDirs) -> anyhow::Result<(GradingInfo, GzipFileMap)> {
    let output = dirs.output.clone();

    tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let result_path = output.join(RESULT_FILENAME);
        if !result_path.is_file() {
            bail!("Cannot find output file ('{}') after grading", result_path.display());
        }

        let raw = std::fs::read_to_string(&result_path)
            .with_context(|| format!("Failed to read {}", result_path.display()))?;
        let info: GradingInfo = serde_json::from_str(&raw)
            .with_context(|| format!("Grader wrote an invalid result to {}", result_path.display()))?;
        let files = gzip_dir(&output)
            .with_context(|| format!("Failed to copy grading output '{}'", output.display()))?;

        Ok((info, files))
    })
    .await
    .context("grading output task panicked")?
}

fn stamp_times(
    info: &mut GradingInfo,
    assignment: &Assignment,
    options: &GradeOptions,
    start: Timestamp,
    end: Timestamp,
) {
    if !options.is_proxy() {
        info.grading_start_time = start;
        info.grading_end_time = end;
        return;
    }

    let proxy_start = resolve_proxy_time(options.proxy_time, assignment, start);
    info.proxy_user = options.proxy_user.clone();
    info.grading_start_time = proxy_start;
    info.grading_end_time = proxy_start.add_msecs(end.to_msecs() - start.to_msecs());
    info.proxy_start_time = Some(start);
    info.proxy_end_time = Some(end);
}

/// Grading time goes to the metrics facade right away and to the backend in the background.
fn record_metric(state: &AppState, assignment: &Assignment, email: &str, start: Timestamp, end: Timestamp) {
    let elapsed_msecs = end.to_msecs() - start.to_msecs();
    metrics::histogram!(
        GRADING_DURATION,
        "course" => assignment.course_id.clone(),
        "assignment" => assignment.id.clone()
    )
    .record(elapsed_msecs as f64 / 1000.0);

    let metric = Metric {
        timestamp: start,
        kind: MetricKind::GradingTime,
        value: elapsed_msecs,
        attributes: BTreeMap::from([
            (String::from("course"), assignment.course_id.clone()),
            (String::from("assignment"), assignment.id.clone()),
            (String::from("user"), email.to_string()),
        ]),
    };

    let backend = state.backend().clone();
    tokio::spawn(async move {
        if let Err(err) = backend.store_metric(&metric).await {
            tracing::warn!(error = %err, "Failed to store grading metric");
        }
    });
}
