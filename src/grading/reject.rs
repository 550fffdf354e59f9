use std::fmt;

use anyhow::Context;
use serde::Serialize;

use crate::core::time::{format_duration_msecs, Timestamp};
use crate::db::types::{CourseRole, ServerRole};
use crate::db::Backend;
use crate::models::assignment::{Assignment, SubmissionWindow};
use crate::models::grading::SubmissionHistoryItem;
use crate::models::scheduled_time::DurationSpec;

/// Why an otherwise valid submission was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub(crate) enum RejectReason {
    MaxAttempts {
        max: u32,
    },
    WindowMax {
        max: u32,
        duration: DurationSpec,
        earliest: Timestamp,
    },
    Late {
        #[serde(rename = "assignment-name")]
        assignment_name: String,
        #[serde(rename = "due-date")]
        due_date: Timestamp,
    },
}

impl RejectReason {
    /// The message with the window's next allowed time measured from `now`.
    pub(crate) fn message_at(&self, now: Timestamp) -> String {
        match self {
            RejectReason::MaxAttempts { max } => format!("Reached the number of max attempts: {max}."),
            RejectReason::WindowMax { max, duration, earliest } => {
                let next = earliest.add_msecs(duration.total_msecs());
                let delta = (next.to_msecs() - now.to_msecs()).max(0);
                format!(
                    "Reached the number of max attempts ({max}) within submission window ({}). \
                     Next allowed submission time is {} (in {}).",
                    duration.short_string(),
                    next.to_rfc3339(),
                    format_duration_msecs(delta)
                )
            }
            RejectReason::Late { assignment_name, due_date } => format!(
                "Attempting to submit assignment ({assignment_name}) after the due date ({}).",
                due_date.to_rfc3339()
            ),
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message_at(Timestamp::now()))
    }
}

/// Apply the submission policy for `email` at `now`. Unknown users are an error.
pub(crate) async fn check_rejection(
    backend: &dyn Backend,
    assignment: &Assignment,
    email: &str,
    now: Timestamp,
    allow_late: bool,
) -> anyhow::Result<Option<RejectReason>> {
    let user = backend
        .get_server_user(email)
        .await?
        .with_context(|| format!("Unable to find user '{email}'"))?;

    if user.role >= ServerRole::Admin {
        return Ok(None);
    }

    if let Some(due_date) = assignment.due_date {
        if !allow_late && now > due_date {
            return Ok(Some(RejectReason::Late {
                assignment_name: assignment.display_name().to_string(),
                due_date,
            }));
        }
    }

    if user.effective_course_role(&assignment.course_id) >= CourseRole::Grader {
        return Ok(None);
    }

    let Some(limit) = &assignment.submission_limit else {
        return Ok(None);
    };

    let history: Vec<SubmissionHistoryItem> = backend
        .get_submission_history(assignment, &user.email)
        .await
        .with_context(|| format!("Failed to get submission history for '{}'", user.email))?
        .into_iter()
        .filter(|item| !item.is_proxy())
        .collect();

    if let Some(max) = limit.max {
        if history.len() >= max as usize {
            return Ok(Some(RejectReason::MaxAttempts { max }));
        }
    }

    Ok(limit.window.as_ref().and_then(|window| check_window(window, &history, now)))
}

/// Only submissions strictly after `now - duration` count against the window.
fn check_window(
    window: &SubmissionWindow,
    history: &[SubmissionHistoryItem],
    now: Timestamp,
) -> Option<RejectReason> {
    let start = now.add_msecs(-window.duration.total_msecs());
    let in_window: Vec<Timestamp> = history
        .iter()
        .map(|item| item.grading_start_time)
        .filter(|time| *time > start)
        .collect();

    if in_window.len() < window.allowed_attempts as usize {
        return None;
    }

    Some(RejectReason::WindowMax {
        max: window.allowed_attempts,
        duration: window.duration.clone(),
        earliest: in_window.into_iter().min().unwrap_or(now),
    })
}
