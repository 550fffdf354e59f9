use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request},
    Router,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::api;
use crate::core::bootstrap;
use crate::core::config::{ConfigMap, Settings};
use crate::core::security;
use crate::core::state::AppState;
use crate::core::time::Timestamp;
use crate::models::assignment::Assignment;
use crate::models::grading::{submission_full_id, GradedQuestion, GradingInfo, GradingResult, RESULT_FILENAME};
use crate::services::archive::gzip_bytes;
use crate::services::course_loader;

pub(crate) const TEST_SECRET_KEY: &str = "test-secret";
pub(crate) const COURSE_ID: &str = bootstrap::TEST_COURSE_ID;
pub(crate) const ASSIGNMENT_ID: &str = "hw0";

pub(crate) const OTHER: &str = "course-other@test.edulinq.org";
pub(crate) const STUDENT: &str = "course-student@test.edulinq.org";
pub(crate) const GRADER: &str = "course-grader@test.edulinq.org";
pub(crate) const ADMIN: &str = "course-admin@test.edulinq.org";
pub(crate) const OWNER: &str = "course-owner@test.edulinq.org";
pub(crate) const SERVER_ADMIN: &str = "server-admin@test.edulinq.org";

const GRADER_SCRIPT: &str = r#"#!/bin/sh
# Usage: grader.sh <inputdir> <outpath>
if [ ! -f "$1/submission.py" ]; then
    echo "missing submission.py" >&2
fi
cat > "$2" <<'EOF'
{"name": "hw0", "questions": [
    {"name": "Q1", "max_points": 1, "score": 1},
    {"name": "Q2", "max_points": 1, "score": 1}
]}
EOF
echo "graded"
"#;

const SUBMISSION: &str = "def add(a, b):\n    return a + b\n\nprint(add(1, 2))\n";

pub(crate) struct TestContext {
    pub(crate) state: AppState,
    pub(crate) app: Router,
    dir: tempfile::TempDir,
    _guard: OwnedMutexGuard<()>,
}

impl TestContext {
    pub(crate) fn dir(&self) -> &Path {
        self.dir.path()
    }
}

pub(crate) async fn env_lock() -> OwnedMutexGuard<()> {
    static LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Arc::new(Mutex::new(()))).clone();
    lock.lock_owned().await
}

pub(crate) fn test_settings(base: &Path) -> Settings {
    let base_dir = base.to_string_lossy().to_string();
    let map: ConfigMap = [
        ("dirs.base", base_dir.as_str()),
        ("db.type", "memory"),
        ("docker.disable", "true"),
        ("tasks.disable", "true"),
        ("testing", "true"),
        ("web.token.secret", TEST_SECRET_KEY),
        ("grading.runtime.max", "30"),
    ]
    .iter()
    .map(|(key, value)| (key.to_string(), value.to_string()))
    .collect();

    let mut map = map;
    map.insert(String::from("work.dir"), base.join("work").to_string_lossy().to_string());

    Settings::from_map(&map).expect("test settings")
}

/// `course101` with a single local-invocation assignment `hw0`.
pub(crate) fn write_course_fixture(root: &Path) -> PathBuf {
    let course_dir = root.join(COURSE_ID);
    let assignment_dir = course_dir.join(ASSIGNMENT_ID);
    let solution_dir = assignment_dir.join("test-submissions").join("solution");
    std::fs::create_dir_all(&solution_dir).expect("fixture dirs");

    let course = serde_json::json!({"id": COURSE_ID, "name": "Course 101"});
    std::fs::write(course_dir.join("course.json"), course.to_string()).expect("course.json");

    let assignment = serde_json::json!({
        "id": ASSIGNMENT_ID,
        "name": "Homework 0",
        "invocation": ["sh", "./grader.sh", "<inputdir>", "<outpath>"],
        "static-files": ["grader.sh"],
        "max-runtime-secs": 0,
    });
    std::fs::write(assignment_dir.join("assignment.json"), assignment.to_string()).expect("assignment.json");
    std::fs::write(assignment_dir.join("grader.sh"), GRADER_SCRIPT).expect("grader.sh");

    std::fs::write(solution_dir.join("submission.py"), SUBMISSION).expect("submission");
    let expected = serde_json::json!({
        "result": {
            "name": "hw0",
            "questions": [
                {"name": "Q1", "max_points": 1, "score": 1},
                {"name": "Q2", "max_points": 1, "score": 1},
            ],
        },
    });
    std::fs::write(solution_dir.join("test-submission.json"), expected.to_string()).expect("test submission");

    course_dir
}

/// A fresh submission dir under `root`.
pub(crate) fn write_submission(root: &Path) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let dir = root.join(format!("submission-{}", COUNTER.fetch_add(1, Ordering::SeqCst)));
    std::fs::create_dir_all(&dir).expect("submission dir");
    std::fs::write(dir.join("submission.py"), SUBMISSION).expect("submission");
    dir
}

/// Memory backend with the standard users and the fixture course loaded.
pub(crate) async fn test_state() -> TestContext {
    let guard = env_lock().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = test_settings(dir.path());
    write_course_fixture(&settings.dirs().courses_root);

    let state = AppState::open(settings).await.expect("state");
    bootstrap::seed_test_users(state.backend().as_ref(), false).await.expect("users");
    let loaded = course_loader::load_courses_root(&state).await.expect("courses");
    assert_eq!(loaded, vec![COURSE_ID.to_string()]);

    let app = api::router::router(state.clone());
    TestContext { state, app, dir, _guard: guard }
}

pub(crate) async fn assignment(state: &AppState) -> Assignment {
    let course = state.backend().get_course(COURSE_ID).await.expect("get course").expect("course");
    course.assignment(ASSIGNMENT_ID).cloned().expect("assignment")
}

/// Store a 2/2 submission started at `short_id` seconds.
pub(crate) async fn store_submission(state: &AppState, assignment: &Assignment, email: &str, short_id: &str) -> GradingInfo {
    store_submission_by(state, assignment, email, short_id, None).await
}

/// Like `store_submission`, but made by `proxy_user` on the user's behalf when given.
pub(crate) async fn store_submission_by(
    state: &AppState,
    assignment: &Assignment,
    email: &str,
    short_id: &str,
    proxy_user: Option<&str>,
) -> GradingInfo {
    let start = Timestamp::from_secs(short_id.parse().expect("numeric short id"));
    let mut info = GradingInfo {
        id: submission_full_id(&assignment.course_id, &assignment.id, email, short_id),
        short_id: short_id.to_string(),
        course_id: assignment.course_id.clone(),
        assignment_id: assignment.id.clone(),
        user: email.to_string(),
        name: assignment.id.clone(),
        questions: vec![GradedQuestion::new("Q1", 1.0, 1.0), GradedQuestion::new("Q2", 1.0, 1.0)],
        grading_start_time: start,
        grading_end_time: start.add_msecs(1000),
        proxy_user: proxy_user.map(str::to_string),
        proxy_start_time: proxy_user.map(|_| start),
        ..GradingInfo::default()
    };
    info.compute_points();

    let result = GradingResult {
        info: Some(info.clone()),
        input_files_gzip: [(String::from("submission.py"), gzip_bytes(SUBMISSION.as_bytes()).expect("gzip"))]
            .into_iter()
            .collect(),
        output_files_gzip: [(
            String::from(RESULT_FILENAME),
            gzip_bytes(&serde_json::to_vec(&info).expect("json")).expect("gzip"),
        )]
        .into_iter()
        .collect(),
        stdout: String::from("graded\n"),
        stderr: String::new(),
    };

    state
        .backend()
        .save_submissions(&assignment.course_id, &[result])
        .await
        .expect("save submission");
    info
}

pub(crate) fn bearer_token(email: &str, settings: &Settings) -> String {
    security::create_access_token(email, settings, None).expect("token")
}

pub(crate) fn json_request(
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<serde_json::Value>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);

    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    if let Some(body) = body {
        let bytes = serde_json::to_vec(&body).expect("serialize body");
        builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(bytes))
            .expect("request body")
    } else {
        builder.body(Body::empty()).expect("request body")
    }
}

pub(crate) async fn read_json(response: axum::response::Response<Body>) -> serde_json::Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("response body");
    serde_json::from_slice(&body).unwrap_or_else(|err| {
        let body_text = String::from_utf8_lossy(&body);
        panic!("json parse: {err}; body: {body_text}");
    })
}
