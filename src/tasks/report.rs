use std::fmt::Write as _;

use anyhow::Context;
use serde::Serialize;

use crate::core::state::AppState;
use crate::db::types::CourseRole;
use crate::models::course::Course;
use crate::models::tasks::UserTaskInfo;
use crate::services::email::EmailMessage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub(crate) struct ScoreStats {
    pub(crate) count: usize,
    pub(crate) min: f64,
    pub(crate) max: f64,
    pub(crate) mean: f64,
    pub(crate) median: f64,
    /// Population standard deviation.
    pub(crate) stddev: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct AssignmentReport {
    pub(crate) assignment_id: String,
    pub(crate) name: String,
    pub(crate) students: usize,
    pub(crate) stats: Option<ScoreStats>,
}

/// `None` for an empty slice.
pub(crate) fn compute_stats(scores: &[f64]) -> Option<ScoreStats> {
    if scores.is_empty() {
        return None;
    }

    let mut sorted = scores.to_vec();
    sorted.sort_by(f64::total_cmp);

    let count = sorted.len();
    let mean = sorted.iter().sum::<f64>() / count as f64;
    let median = if count % 2 == 0 {
        (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
    } else {
        sorted[count / 2]
    };
    let variance = sorted.iter().map(|score| (score - mean).powi(2)).sum::<f64>() / count as f64;

    Some(ScoreStats {
        count,
        min: sorted[0],
        max: sorted[count - 1],
        mean,
        median,
        stddev: variance.sqrt(),
    })
}

/// Score statistics over each assignment's most recent student submissions.
pub(crate) async fn build_report(state: &AppState, course: &Course) -> anyhow::Result<Vec<AssignmentReport>> {
    let users = state.backend().get_course_users(&course.id).await?;
    let students: Vec<String> = users
        .values()
        .filter(|user| user.role == CourseRole::Student)
        .map(|user| user.email.clone())
        .collect();

    let mut reports = Vec::with_capacity(course.assignments.len());
    for assignment in course.assignments.values() {
        let recent = state
            .backend()
            .get_recent_submissions(assignment, &students)
            .await
            .with_context(|| format!("Failed to get recent submissions for '{}'", assignment.full_id()))?;
        let scores: Vec<f64> = recent.values().flatten().map(|info| info.score).collect();

        reports.push(AssignmentReport {
            assignment_id: assignment.id.clone(),
            name: assignment.display_name().to_string(),
            students: students.len(),
            stats: compute_stats(&scores),
        });
    }

    Ok(reports)
}

pub(crate) fn render_report(course: &Course, reports: &[AssignmentReport]) -> String {
    let mut body = format!("Autograder report for course: {}.\n\n", course.display_name());
    for report in reports {
        let _ = writeln!(body, "{} ({})", report.name, report.assignment_id);
        match &report.stats {
            None => {
                let _ = writeln!(body, "    no submissions from {} students", report.students);
            }
            Some(stats) => {
                let _ = writeln!(
                    body,
                    "    submitted: {} / {}\n    min: {:.2}, max: {:.2}, mean: {:.2}, median: {:.2}, stddev: {:.2}",
                    stats.count, report.students, stats.min, stats.max, stats.mean, stats.median, stats.stddev
                );
            }
        }
    }
    body
}

pub(super) async fn run(state: &AppState, course: &Course, info: &UserTaskInfo) -> anyhow::Result<()> {
    let to: Vec<String> = info.option("to", Vec::new())?;
    let reports = build_report(state, course).await?;
    let body = render_report(course, &reports);

    state
        .mailer()
        .send(EmailMessage::text(&to, &format!("Autograder Scoring Report for {}", course.display_name()), &body))
        .await
        .with_context(|| format!("Failed to send report for course '{}'", course.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, STUDENT};

    #[test]
    fn stats_over_even_and_odd_counts() {
        assert_eq!(compute_stats(&[]), None);

        let odd = compute_stats(&[3.0, 1.0, 2.0]).expect("stats");
        assert_eq!((odd.min, odd.max, odd.median, odd.mean), (1.0, 3.0, 2.0, 2.0));

        let even = compute_stats(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).expect("stats");
        assert_eq!(even.median, 4.5);
        assert_eq!(even.mean, 5.0);
        assert_eq!(even.stddev, 2.0);
    }

    #[tokio::test]
    async fn report_counts_latest_student_scores() {
        let context = test_support::test_state().await;
        let state = &context.state;
        let assignment = test_support::assignment(state).await;
        test_support::store_submission(state, &assignment, STUDENT, "100").await;

        let course = state.backend().get_course(&assignment.course_id).await.expect("get").expect("course");
        let reports = build_report(state, &course).await.expect("report");
        assert_eq!(reports.len(), 1);
        let stats = reports[0].stats.expect("stats");
        assert_eq!(stats.count, 1);
        assert_eq!(stats.max, 2.0);

        let info = UserTaskInfo::new(
            crate::models::tasks::TaskType::Report,
            crate::models::scheduled_time::ScheduledTime::daily("03:00"),
        )
        .with_option("to", serde_json::json!(["course-admin@test.edulinq.org"]));
        run(state, &course, &info).await.expect("run");

        let outbox = state.mailer().outbox();
        let sent = outbox.last().expect("sent");
        assert_eq!(sent.to, vec![String::from("course-admin@test.edulinq.org")]);
        assert!(sent.body.contains("submitted: 1 / 1"), "{}", sent.body);
    }
}
