use anyhow::{bail, Context};

use crate::core::state::AppState;
use crate::core::time::Timestamp;
use crate::models::course::Course;
use crate::models::logs::RawLogQuery;
use crate::models::tasks::UserTaskInfo;
use crate::services::email::EmailMessage;

/// Email the course's log records matching the task query. Returns how many were sent.
pub(super) async fn run(state: &AppState, course: &Course, info: &UserTaskInfo, now: Timestamp) -> anyhow::Result<usize> {
    let to: Vec<String> = info.option("to", Vec::new())?;
    let send_empty: bool = info.option("send-empty", false)?;
    let mut raw: RawLogQuery = info.option("query", RawLogQuery::default())?;

    // Scoped to the owning course whatever the query says.
    raw.course_id = course.id.clone();
    let (query, errors) = raw.parse(now);
    if !errors.is_empty() {
        bail!("Invalid log query: {}", errors.join(" "));
    }

    let records = state.backend().get_log_records(&query).await.context("Failed to query log records")?;
    if records.is_empty() && !send_empty {
        tracing::debug!(course_id = %course.id, "No log records to email");
        return Ok(0);
    }

    let body = records
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to encode log records")?
        .join("\n");
    let subject = format!("Autograder Logs for {} ({} records)", course.display_name(), records.len());

    state
        .mailer()
        .send(EmailMessage::text(&to, &subject, &body))
        .await
        .with_context(|| format!("Failed to email logs for course '{}'", course.id))?;

    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::telemetry;
    use crate::db::types::LogLevel;
    use crate::models::logs::LogContext;
    use crate::models::scheduled_time::ScheduledTime;
    use crate::models::tasks::TaskType;
    use crate::test_support::{self, COURSE_ID};

    fn task(send_empty: bool) -> UserTaskInfo {
        UserTaskInfo::new(TaskType::EmailLogs, ScheduledTime::daily("03:00"))
            .with_option("to", serde_json::json!(["course-owner@test.edulinq.org"]))
            .with_option("send-empty", serde_json::json!(send_empty))
            .with_option("query", serde_json::json!({"level": "warn", "past": "24h"}))
    }

    #[tokio::test]
    async fn only_matching_course_records_are_sent() {
        let context = test_support::test_state().await;
        let state = &context.state;
        let course = state.backend().get_course(COURSE_ID).await.expect("get").expect("course");

        for (level, course_id) in [(LogLevel::Error, COURSE_ID), (LogLevel::Info, COURSE_ID), (LogLevel::Error, "other")] {
            telemetry::log_record(
                state.backend().as_ref(),
                LogLevel::Trace,
                level,
                "something happened",
                LogContext::course(course_id),
            )
            .await;
        }

        let sent = run(state, &course, &task(false), Timestamp::now()).await.expect("run");
        assert_eq!(sent, 1);
        assert_eq!(state.mailer().outbox().len(), 1);
    }

    #[tokio::test]
    async fn empty_results_are_skipped_unless_asked_for() {
        let context = test_support::test_state().await;
        let state = &context.state;
        let course = state.backend().get_course(COURSE_ID).await.expect("get").expect("course");
        state.mailer().clear_outbox();

        assert_eq!(run(state, &course, &task(false), Timestamp::now()).await.expect("run"), 0);
        assert!(state.mailer().outbox().is_empty());

        assert_eq!(run(state, &course, &task(true), Timestamp::now()).await.expect("run"), 0);
        assert_eq!(state.mailer().outbox().len(), 1);
    }
}
