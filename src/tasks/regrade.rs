use anyhow::Context;

use crate::core::state::AppState;
use crate::grading::regrade::{regrade, RegradeOptions};
use crate::jobs::JobOptions;
use crate::models::course::Course;
use crate::models::tasks::UserTaskInfo;
use crate::models::user::ROOT_EMAIL;
use crate::models::user_reference::CourseUserReference;

/// Regrade the selected users (default: everyone enrolled) on the selected assignments
/// (default: all of them), one assignment after another.
pub(super) async fn run(state: &AppState, course: &Course, info: &UserTaskInfo) -> anyhow::Result<()> {
    let raw_users: Vec<String> = info.option("users", vec![String::from("*")])?;
    let assignment_ids: Vec<String> = info.option("assignments", Vec::new())?;

    let (reference, warnings) = CourseUserReference::parse(&raw_users);
    for warning in warnings {
        tracing::warn!(course_id = %course.id, %warning, "Ignoring part of the regrade user reference");
    }

    let users: Vec<_> = state.backend().get_course_users(&course.id).await?.into_values().collect();
    let emails = reference.resolve(&users);

    for assignment in course.assignments.values() {
        if !assignment_ids.is_empty() && !assignment_ids.contains(&assignment.id) {
            continue;
        }

        let options = RegradeOptions {
            users: emails.clone(),
            regrade_after: None,
            proxy_user: ROOT_EMAIL.to_string(),
            job: JobOptions { wait_for_completion: true, ..JobOptions::default() },
        };

        let output = regrade(state, state.shutdown(), assignment, options)
            .await
            .with_context(|| format!("Failed to regrade '{}'", assignment.full_id()))?;

        for (email, error) in &output.work_errors {
            tracing::warn!(assignment = %assignment.full_id(), user = %email, %error, "Regrade failed for user");
        }
        tracing::info!(
            assignment = %assignment.full_id(),
            regraded = output.results.values().filter(|item| item.is_some()).count(),
            failed = output.work_errors.len(),
            "Regraded assignment"
        );
    }

    Ok(())
}
