//! Pushing final scores to the course's LMS.
//!
//! Every upload leaves a JSON comment with the [`ScoringInfo`] behind it. Later uploads
//! rewrite that comment in place, skip users whose score did not change, and never touch
//! a grade that carries a lock comment.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Context};

use crate::core::state::AppState;
use crate::core::time::Timestamp;
use crate::db::types::CourseRole;
use crate::models::assignment::Assignment;
use crate::models::course::Course;
use crate::models::scoring::{is_lock_comment, ScoringInfo};
use crate::models::user::CourseUser;
use crate::services::lms::{CommentUpdate, LmsAdapter, LmsComment, LmsScore};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct UploadSummary {
    pub(crate) uploaded: usize,
    pub(crate) locked: usize,
    pub(crate) unchanged: usize,
}

pub(crate) async fn run(state: &AppState, course: &Course, now: Timestamp) -> anyhow::Result<UploadSummary> {
    let Some(adapter) = state.lms_for(course)? else {
        bail!("Course '{}' has no LMS to upload scores to", course.id);
    };

    let users = state.backend().get_course_users(&course.id).await?;

    // Users synced before their LMS id was known are matched by email.
    let lms_ids: BTreeMap<String, String> = adapter
        .fetch_users()
        .await
        .context("Failed to fetch LMS users")?
        .into_iter()
        .map(|user| (user.email.trim().to_lowercase(), user.id))
        .collect();

    let mut summary = UploadSummary::default();

    for assignment in course.assignments.values() {
        let Some(lms_id) = assignment.lms_id.as_deref() else {
            tracing::debug!(assignment = %assignment.full_id(), "Assignment has no LMS id, skipping upload");
            continue;
        };

        let result = upload_assignment(state, adapter.as_ref(), assignment, lms_id, &users, &lms_ids, now)
            .await
            .with_context(|| format!("Failed to upload scores for '{}'", assignment.full_id()))?;
        summary.uploaded += result.uploaded;
        summary.locked += result.locked;
        summary.unchanged += result.unchanged;
    }

    tracing::info!(
        course_id = %course.id,
        uploaded = summary.uploaded,
        locked = summary.locked,
        unchanged = summary.unchanged,
        "Uploaded scores"
    );
    Ok(summary)
}

async fn upload_assignment(
    state: &AppState,
    adapter: &dyn LmsAdapter,
    assignment: &Assignment,
    lms_id: &str,
    users: &BTreeMap<String, CourseUser>,
    lms_ids: &BTreeMap<String, String>,
    now: Timestamp,
) -> anyhow::Result<UploadSummary> {
    let students: Vec<String> = users
        .values()
        .filter(|user| user.role == CourseRole::Student)
        .map(|user| user.email.clone())
        .collect();
    let enrolled: BTreeSet<String> = students.iter().cloned().collect();

    let recent = state.backend().get_recent_submissions(assignment, &students).await?;
    let mut scores: BTreeMap<String, ScoringInfo> = recent
        .into_iter()
        .filter_map(|(email, info)| info.map(|info| (email, ScoringInfo::from_grading_info(&info))))
        .collect();

    assignment
        .late_policy()
        .apply(&mut scores, &enrolled, assignment.due_date, assignment.max_points)?;

    let existing: BTreeMap<String, LmsScore> = adapter
        .fetch_assignment_scores(lms_id)
        .await?
        .into_iter()
        .map(|score| (score.user_id.clone(), score))
        .collect();

    let mut summary = UploadSummary::default();
    let mut uploads = Vec::new();
    let mut comment_updates = Vec::new();

    for (email, mut info) in scores {
        if info.reject {
            continue;
        }

        let Some(lms_user_id) = users
            .get(&email)
            .and_then(|user| user.lms_id.clone())
            .or_else(|| lms_ids.get(&email).cloned())
        else {
            tracing::warn!(user = %email, "User has no LMS id, skipping score upload");
            continue;
        };

        let previous = existing.get(&lms_user_id);
        let comments = previous.map(|score| score.comments.as_slice()).unwrap_or_default();

        if comments.iter().any(|comment| is_lock_comment(&comment.text)) {
            summary.locked += 1;
            continue;
        }

        let prior = comments.iter().find_map(|comment| match ScoringInfo::from_comment(&comment.text) {
            Some(Ok(prior)) => Some((comment, prior)),
            Some(Err(err)) => {
                tracing::warn!(user = %email, error = %err, "Unreadable autograder comment");
                None
            }
            None => None,
        });

        if let (Some(score), Some((_, prior))) = (previous, &prior) {
            if prior.lock {
                summary.locked += 1;
                continue;
            }
            if prior.score == info.score && score.score == info.score {
                summary.unchanged += 1;
                continue;
            }
        }

        info.upload_time = now;
        let text = info.to_comment();
        let mut score = LmsScore { user_id: lms_user_id.clone(), score: info.score, time: Some(now), comments: Vec::new() };

        match prior {
            Some((comment, _)) => comment_updates.push(CommentUpdate {
                user_id: lms_user_id,
                comment: LmsComment { id: comment.id.clone(), author: comment.author.clone(), text },
            }),
            None => score.comments.push(LmsComment { text, ..LmsComment::default() }),
        }

        uploads.push(score);
    }

    summary.uploaded = uploads.len();
    if !uploads.is_empty() {
        adapter.update_assignment_scores(lms_id, &uploads).await?;
    }
    if !comment_updates.is_empty() {
        adapter.update_comments(lms_id, &comment_updates).await?;
    }

    Ok(summary)
}
