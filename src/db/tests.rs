use std::collections::BTreeMap;

use super::disk::DiskBackend;
use super::memory::MemoryBackend;
use super::*;
use crate::db::types::{CourseRole, LogLevel};
use crate::models::grading::{submission_full_id, GradedQuestion};
use crate::models::image::ImageInfo;
use crate::models::logs::LogContext;
use crate::models::scheduled_time::{DurationSpec, ScheduledTime};
use crate::models::tasks::{TaskLimits, TaskType, UserTaskInfo};
use crate::models::user::UserToken;
use crate::services::archive::gzip_bytes;

const STUDENT: &str = "course-student@test.edulinq.org";

fn assignment() -> Assignment {
    Assignment::new("course101", "hw0", ImageInfo::default())
}

fn result(short_id: &str, start_secs: i64) -> GradingResult {
    let mut info = GradingInfo {
        id: submission_full_id("course101", "hw0", STUDENT, short_id),
        short_id: short_id.to_string(),
        course_id: String::from("course101"),
        assignment_id: String::from("hw0"),
        user: STUDENT.to_string(),
        name: String::from("hw0"),
        questions: vec![GradedQuestion::new("Q1", 1.0, 2.0)],
        grading_start_time: Timestamp::from_secs(start_secs),
        grading_end_time: Timestamp::from_secs(start_secs + 1),
        ..GradingInfo::default()
    };
    info.compute_points();

    let mut input = BTreeMap::new();
    input.insert(String::from("submission.py"), gzip_bytes(b"print(1)\n").expect("gzip"));

    GradingResult {
        info: Some(info),
        input_files_gzip: input,
        output_files_gzip: BTreeMap::new(),
        stdout: String::from("out"),
        stderr: String::new(),
    }
}

fn task(hash: &str, next_secs: i64) -> FullScheduledTask {
    let limits = TaskLimits { min_period_secs: 0, utc_offset: time::UtcOffset::UTC };
    let info = UserTaskInfo::new(TaskType::Backup, ScheduledTime::every(DurationSpec::from_days(1)));
    let mut task = info
        .to_full_course_task("course101", &limits, Timestamp::zero())
        .expect("task")
        .expect("enabled");
    task.hash = hash.to_string();
    task.next_run_time = Timestamp::from_secs(next_secs);
    task
}

async fn with_backends<F, Fut>(check: F)
where
    F: Fn(Arc<dyn Backend>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    check(Arc::new(MemoryBackend::new())).await;

    let dir = tempfile::tempdir().expect("tempdir");
    let disk = DiskBackend::open(dir.path()).await.expect("disk");
    check(Arc::new(disk)).await;
}

#[tokio::test]
async fn removing_the_most_recent_submission_exposes_the_previous_one() {
    with_backends(|backend| async move {
        let assignment = assignment();
        let results: Vec<GradingResult> = [1697406256, 1697406265, 1697406272]
            .into_iter()
            .map(|id| result(&id.to_string(), id))
            .collect();
        backend.save_submissions("course101", &results).await.expect("save");

        assert!(backend.remove_submission(&assignment, STUDENT, None).await.expect("remove"));

        let recent = backend
            .get_submission_result(&assignment, STUDENT, None)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(recent.short_id, "1697406265");

        let previous = backend
            .get_previous_submission_id(&assignment, STUDENT, "1697406265")
            .await
            .expect("previous");
        assert_eq!(previous.as_deref(), Some("1697406256"));

        assert!(!backend
            .remove_submission(&assignment, STUDENT, Some("1697406272"))
            .await
            .expect("remove missing"));
    })
    .await;
}

#[tokio::test]
async fn submission_contents_round_trip() {
    with_backends(|backend| async move {
        let assignment = assignment();
        let saved = result("1697406256", 1697406256);
        backend.save_submissions("course101", &[saved.clone()]).await.expect("save");
        backend.save_submissions("course101", &[saved.clone()]).await.expect("save again");

        let loaded = backend
            .get_submission_contents(&assignment, STUDENT, Some("1697406256"))
            .await
            .expect("get")
            .expect("present");
        assert_eq!(loaded.info, saved.info);
        assert_eq!(loaded.stdout, "out");
        assert_eq!(loaded.input_files_gzip.keys().collect::<Vec<_>>(), vec!["submission.py"]);

        let history = backend.get_submission_history(&assignment, STUDENT).await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].score, 1.0);
        assert_eq!(history[0].max_points, 2.0);

        assert!(backend
            .get_submission_result(&assignment, "nobody@test.edulinq.org", None)
            .await
            .expect("missing")
            .is_none());
    })
    .await;
}

#[tokio::test]
async fn next_submission_ids_increase() {
    with_backends(|backend| async move {
        let assignment = assignment();
        let now = Timestamp::now().to_secs();
        let taken = (now + 100).to_string();
        backend.save_submissions("course101", &[result(&taken, now)]).await.expect("save");

        let next = backend.get_next_submission_id(&assignment, STUDENT).await.expect("next");
        assert_eq!(next, (now + 101).to_string());

        let other = backend
            .get_next_submission_id(&assignment, "course-other@test.edulinq.org")
            .await
            .expect("next");
        assert!(other.parse::<i64>().expect("numeric") >= now);
    })
    .await;
}

#[tokio::test]
async fn next_active_task_is_the_earliest_and_claims_are_exclusive() {
    with_backends(|backend| async move {
        let mut upserts = TaskUpserts::new();
        upserts.insert(String::from("late"), Some(task("late", 2000)));
        upserts.insert(String::from("early"), Some(task("early", 1000)));
        backend.upsert_active_tasks(&upserts).await.expect("upsert");

        let next = backend.get_next_active_task().await.expect("next").expect("present");
        assert_eq!(next.hash, "early");

        let advanced = next.advanced(Timestamp::from_secs(1000), time::UtcOffset::UTC);
        assert!(backend.claim_active_task(&next, &advanced).await.expect("claim"));
        assert!(!backend.claim_active_task(&next, &advanced).await.expect("second claim"));

        let next = backend.get_next_active_task().await.expect("next").expect("present");
        assert_eq!(next.hash, "late");

        let mut removal = TaskUpserts::new();
        removal.insert(String::from("late"), None);
        removal.insert(String::from("early"), None);
        backend.upsert_active_tasks(&removal).await.expect("remove");
        assert!(backend.get_next_active_task().await.expect("next").is_none());
    })
    .await;
}

#[tokio::test]
async fn task_completions_keep_only_the_latest() {
    with_backends(|backend| async move {
        backend
            .log_task_completion("course101", "task", Timestamp::from_secs(10))
            .await
            .expect("log");
        backend
            .log_task_completion("course101", "task", Timestamp::from_secs(20))
            .await
            .expect("log");

        let last = backend.get_task_completion("course101", "task").await.expect("get");
        assert_eq!(last, Some(Timestamp::from_secs(20)));
        assert_eq!(backend.get_task_completion("course101", "other").await.expect("get"), None);
    })
    .await;
}

#[tokio::test]
async fn users_tokens_and_course_membership() {
    with_backends(|backend| async move {
        ensure_root_user(backend.as_ref()).await.expect("root");

        let mut student = ServerUser::new(STUDENT, ServerRole::User)
            .with_course("course101", CourseRole::Student);
        student.tokens.push(UserToken {
            id: String::from("t1"),
            name: String::from("laptop"),
            source: Default::default(),
            hex_digest: String::from("abc"),
            created: Timestamp::from_secs(1),
            accessed: Timestamp::zero(),
        });
        backend.upsert_users(&[student]).await.expect("upsert");

        let users = backend.get_course_users("course101").await.expect("course users");
        assert_eq!(users.keys().collect::<Vec<_>>(), vec![STUDENT]);

        assert!(backend.delete_user_token(STUDENT, "t1").await.expect("delete token"));
        assert!(!backend.delete_user_token(STUDENT, "t1").await.expect("delete again"));

        assert!(backend.remove_user_from_course("course101", STUDENT).await.expect("remove"));
        assert!(backend.get_course_users("course101").await.expect("course users").is_empty());
        assert!(backend.get_server_user(STUDENT).await.expect("get").is_some());

        assert!(backend.get_server_user(ROOT_EMAIL).await.expect("root").is_some());
        assert!(backend.upsert_users(&[ServerUser::new("not-an-email", ServerRole::User)]).await.is_err());
    })
    .await;
}

#[tokio::test]
async fn courses_round_trip_with_assignments() {
    with_backends(|backend| async move {
        let mut course = Course::new("course101");
        course.name = String::from("Course 101");
        course.add_assignment(assignment()).expect("hw0");
        course
            .add_assignment(Assignment::new("course101", "hw1", ImageInfo::default()))
            .expect("hw1");
        backend.save_course(&course).await.expect("save");

        let loaded = backend.get_course("course101").await.expect("get").expect("present");
        assert_eq!(loaded, course);

        course.assignments.remove("hw1");
        backend.save_course(&course).await.expect("save");
        let loaded = backend.get_course("COURSE101").await.expect("get").expect("present");
        assert_eq!(loaded.assignments.keys().collect::<Vec<_>>(), vec!["hw0"]);

        backend.clear_course("course101").await.expect("clear");
        assert!(backend.get_course("course101").await.expect("get").is_none());
        assert!(backend.get_course("bad id").await.is_err());
    })
    .await;
}

#[tokio::test]
async fn logs_are_filtered_by_query() {
    with_backends(|backend| async move {
        let records = [
            LogRecord::new(LogLevel::Info, "a", LogContext::course("course101")),
            LogRecord::new(LogLevel::Error, "b", LogContext::assignment("course101", "hw0")),
            LogRecord::new(LogLevel::Warn, "c", LogContext::default().with_user(STUDENT)),
        ];
        for record in &records {
            backend.log_record(record).await.expect("log");
        }

        let query = LogQuery { level: LogLevel::Warn, ..LogQuery::default() };
        let found = backend.get_log_records(&query).await.expect("query");
        assert_eq!(found.iter().map(|r| r.message.as_str()).collect::<Vec<_>>(), vec!["b", "c"]);

        let query = LogQuery {
            level: LogLevel::Trace,
            course_id: Some(String::from("course101")),
            ..LogQuery::default()
        };
        assert_eq!(backend.get_log_records(&query).await.expect("query").len(), 2);
    })
    .await;
}

#[tokio::test]
async fn pairwise_analysis_is_keyed_by_pair_and_cleared_with_the_course() {
    with_backends(|backend| async move {
        let lhs = submission_full_id("course101", "hw0", STUDENT, "1");
        let rhs = submission_full_id("course101", "hw0", "other@test.edulinq.org", "2");
        let key = PairwiseKey::new(&rhs, &lhs);
        let record = PairwiseAnalysis::new(key.clone(), BTreeMap::new(), vec![[String::from("a.py"), String::new()]]);
        backend.store_pairwise_analysis(&[record.clone()]).await.expect("store");

        let flipped = PairwiseKey::new(&lhs, &rhs);
        let stored = backend.get_pairwise_analysis(&[flipped.clone()]).await.expect("get");
        assert_eq!(stored.get(&flipped), Some(&record));

        backend.clear_course("course101").await.expect("clear");
        assert!(backend.get_pairwise_analysis(&[key]).await.expect("get").is_empty());
    })
    .await;
}
