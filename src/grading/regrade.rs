//! Re-running the most recent submission of a set of users as proxy submissions.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::grade::{grade, GradeOptions, GradeOutcome};
use crate::core::state::AppState;
use crate::core::time::Timestamp;
use crate::jobs::{Job, JobError, JobOptions, JobOutput, JobWork};
use crate::models::assignment::Assignment;
use crate::models::grading::{SubmissionHistoryItem, ID_DELIM};
use crate::services::archive::write_gzip_files;

/// Per user: the new history item, or `None` when the user has nothing to regrade.
pub(crate) type RegradeOutput = JobOutput<String, Option<SubmissionHistoryItem>>;
pub(crate) type RegradeError = JobError<String, Option<SubmissionHistoryItem>>;

#[derive(Debug, Clone, Default)]
pub(crate) struct RegradeOptions {
    /// Resolved, lowercased emails.
    pub(crate) users: Vec<String>,
    /// Users whose latest submission started at or after this are left alone.
    pub(crate) regrade_after: Option<Timestamp>,
    pub(crate) proxy_user: String,
    pub(crate) job: JobOptions,
}

pub(crate) fn lock_key(assignment: &Assignment) -> String {
    format!("regrade{ID_DELIM}{}", assignment.full_id())
}

pub(crate) async fn regrade(
    state: &AppState,
    cancel: &CancellationToken,
    assignment: &Assignment,
    options: RegradeOptions,
) -> Result<RegradeOutput, RegradeError> {
    tracing::info!(
        course_id = %assignment.course_id,
        assignment_id = %assignment.id,
        users = options.users.len(),
        wait = options.job.wait_for_completion,
        dry_run = options.job.dry_run,
        "Starting regrade"
    );

    let work = RegradeWork {
        state: state.clone(),
        assignment: assignment.clone(),
        proxy_user: options.proxy_user,
        regrade_after: options.regrade_after,
        dry_run: options.job.dry_run,
    };

    let job = Job {
        name: String::from("regrade"),
        lock_key: lock_key(assignment),
        pool_size: state.settings().jobs().regrade_pool_size.max(1),
        work_items: options.users,
        options: options.job,
        work: Arc::new(work),
        cancel: cancel.clone(),
    };

    job.run(state.locks(), state.shutdown().child_token()).await
}

struct RegradeWork {
    state: AppState,
    assignment: Assignment,
    proxy_user: String,
    regrade_after: Option<Timestamp>,
    dry_run: bool,
}

#[async_trait]
impl JobWork<String, Option<SubmissionHistoryItem>> for RegradeWork {
    async fn work(&self, cancel: &CancellationToken, email: &String) -> anyhow::Result<Option<SubmissionHistoryItem>> {
        let Some(previous) = self
            .state
            .backend()
            .get_submission_contents(&self.assignment, email, None)
            .await
            .with_context(|| format!("Failed to get most recent submission for '{email}'"))?
        else {
            return Ok(None);
        };

        let Some(info) = previous.info.as_ref() else {
            bail!("Most recent submission for '{email}' has no grading info");
        };

        let work_root = self.state.settings().dirs().work.clone();
        let files = previous.input_files_gzip.clone();
        let input_dir = tokio::task::spawn_blocking(move || -> anyhow::Result<tempfile::TempDir> {
            std::fs::create_dir_all(&work_root)?;
            let dir = tempfile::Builder::new().prefix("autograder-regrade-").tempdir_in(&work_root)?;
            write_gzip_files(&files, dir.path())?;
            Ok(dir)
        })
        .await
        .context("regrade input task panicked")?
        .with_context(|| format!("Failed to write submission input for '{email}'"))?;

        let mut options =
            GradeOptions::proxy(self.state.settings(), &self.proxy_user, Some(info.grading_start_time));
        options.no_store |= self.dry_run;

        let outcome = grade(
            &self.state,
            cancel,
            &self.assignment,
            input_dir.path(),
            email,
            &info.message,
            &options,
        )
        .await
        .map_err(|err| err.error)?;

        match outcome {
            GradeOutcome::Graded(result) => Ok(result.info.map(|info| info.to_history_item())),
            GradeOutcome::SoftFailure { message, .. } => bail!("{message}"),
            GradeOutcome::Rejected(reason) => bail!("Regrade was rejected: {reason}"),
        }
    }

    async fn retrieve(&self, emails: &[String]) -> anyhow::Result<BTreeMap<String, Option<SubmissionHistoryItem>>> {
        let Some(after) = self.regrade_after else {
            return Ok(BTreeMap::new());
        };

        let recent = self.state.backend().get_recent_submissions(&self.assignment, emails).await?;
        Ok(recent
            .into_iter()
            .filter_map(|(email, info)| {
                let info = info?;
                let started = info.proxy_start_time.unwrap_or(info.grading_start_time);
                (started >= after).then(|| (email, Some(info.to_history_item())))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, OTHER, STUDENT};

    fn options(users: &[&str]) -> RegradeOptions {
        RegradeOptions {
            users: users.iter().map(|user| user.to_string()).collect(),
            regrade_after: None,
            proxy_user: String::from(test_support::GRADER),
            job: JobOptions { wait_for_completion: true, ..JobOptions::default() },
        }
    }

    #[tokio::test]
    async fn regrade_makes_proxy_submissions_from_latest_input() {
        let context = test_support::test_state().await;
        let state = &context.state;
        let assignment = test_support::assignment(state).await;
        test_support::store_submission(state, &assignment, STUDENT, "100").await;

        let output = regrade(state, &CancellationToken::new(), &assignment, options(&[STUDENT, OTHER]))
            .await
            .expect("regrade");

        assert!(output.work_errors.is_empty(), "{:?}", output.work_errors);
        assert_eq!(output.results.get(OTHER), Some(&None));

        let item = output.results.get(STUDENT).cloned().flatten().expect("regraded");
        assert_eq!(item.proxy_user.as_deref(), Some(test_support::GRADER));
        assert_eq!(item.score, 2.0);
        assert_eq!(item.grading_start_time, Timestamp::from_secs(100));

        let history = state.backend().get_submission_history(&assignment, STUDENT).await.expect("history");
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn dry_run_stores_nothing() {
        let context = test_support::test_state().await;
        let state = &context.state;
        let assignment = test_support::assignment(state).await;
        test_support::store_submission(state, &assignment, STUDENT, "100").await;

        let mut options = options(&[STUDENT]);
        options.job.dry_run = true;
        let output = regrade(state, &CancellationToken::new(), &assignment, options).await.expect("regrade");

        assert!(output.results.get(STUDENT).is_some_and(Option::is_some));
        let history = state.backend().get_submission_history(&assignment, STUDENT).await.expect("history");
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn fresh_submissions_are_not_regraded() {
        let context = test_support::test_state().await;
        let state = &context.state;
        let assignment = test_support::assignment(state).await;
        test_support::store_submission(state, &assignment, STUDENT, "100").await;

        let mut options = options(&[STUDENT]);
        options.regrade_after = Some(Timestamp::from_secs(50));
        let output = regrade(state, &CancellationToken::new(), &assignment, options).await.expect("regrade");

        let item = output.results.get(STUDENT).cloned().flatten().expect("known");
        assert!(!item.is_proxy());
        let history = state.backend().get_submission_history(&assignment, STUDENT).await.expect("history");
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_regrades_of_one_assignment_are_refused() {
        let context = test_support::test_state().await;
        let state = &context.state;
        let assignment = test_support::assignment(state).await;

        let _held = state.locks().try_lock(&lock_key(&assignment)).expect("lock");
        let err = regrade(state, &CancellationToken::new(), &assignment, options(&[STUDENT]))
            .await
            .expect_err("locked");
        assert!(matches!(err, JobError::Locked(_)));
    }
}
