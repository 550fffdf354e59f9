//! Submitting, inspecting and regrading submissions for one assignment.

use std::path::Path;

use anyhow::Context;
use axum::{extract::State, routing::post, Json, Router};
use base64::Engine;
use tokio_util::sync::CancellationToken;

use crate::api::errors::ApiError;
use crate::api::guards::{require_course_role, CourseAccess, CurrentUser};
use crate::api::{ok, ApiResult};
use crate::core::state::AppState;
use crate::db::types::CourseRole;
use crate::grading::regrade::{regrade, RegradeOptions};
use crate::grading::{grade, GradeOptions, GradeOutcome};
use crate::jobs::JobOptions;
use crate::models::assignment::Assignment;
use crate::models::user::ServerUser;
use crate::models::user_reference::CourseUserReference;
use crate::schemas::submission::{
    EncodedFiles, HistoryResponse, PeekResponse, ProxyRegradeRequest, ProxyRegradeResponse, ProxyResubmitRequest,
    ProxySubmitRequest, RemoveResponse, SubmissionLookupRequest, SubmitRequest, SubmitResponse,
};
use crate::services::archive;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/submit", post(submit))
        .route("/peek", post(peek))
        .route("/history", post(history))
        .route("/remove", post(remove))
        .route("/proxy/submit", post(proxy_submit))
        .route("/proxy/resubmit", post(proxy_resubmit))
        .route("/proxy/regrade", post(proxy_regrade))
}

/// Canceled when the request future is dropped, e.g. on a broken connection.
fn request_token(state: &AppState) -> (CancellationToken, tokio_util::sync::DropGuard) {
    let token = state.shutdown().child_token();
    let guard = token.clone().drop_guard();
    (token, guard)
}

async fn submission_dir(state: &AppState) -> Result<tempfile::TempDir, ApiError> {
    let work_root = state.settings().dirs().work.clone();
    tokio::task::spawn_blocking(move || -> anyhow::Result<tempfile::TempDir> {
        std::fs::create_dir_all(&work_root)?;
        Ok(tempfile::Builder::new().prefix("autograder-submission-").tempdir_in(&work_root)?)
    })
    .await
    .map_err(|e| ApiError::internal("-050", e, "Submission dir task panicked"))?
    .map_err(|e| ApiError::internal("-051", format!("{e:#}"), "Failed to create submission dir"))
}

/// Decode uploaded files into `dir`. Archives are unpacked in place.
fn write_uploads(files: &EncodedFiles, dir: &Path, max_kb: u64) -> Result<(), ApiError> {
    if files.is_empty() {
        return Err(ApiError::bad_request("-052", "No files were submitted."));
    }

    let mut decoded = Vec::with_capacity(files.len());
    let mut total = 0u64;
    for (name, content) in files {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(content.trim())
            .map_err(|_| ApiError::bad_request("-053", format!("File '{name}' is not valid base64.")))?;
        total += bytes.len() as u64;
        decoded.push((name, bytes));
    }

    if total > max_kb * 1024 {
        return Err(ApiError::PayloadTooLarge(
            "-054",
            format!("Submitted files are larger than the limit of {max_kb} KB."),
        ));
    }

    for (name, bytes) in decoded {
        let written = if archive::is_archive_name(name) {
            archive::extract_archive(name, &bytes, dir)
        } else {
            archive::safe_join(dir, name).and_then(|path| {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, &bytes).with_context(|| format!("Failed to write '{name}'"))
            })
        };

        written.map_err(|e| ApiError::bad_request("-055", format!("Could not store file '{name}': {e:#}")))?;
    }

    Ok(())
}

async fn grade_uploads(
    state: &AppState,
    assignment: &Assignment,
    files: &EncodedFiles,
    email: &str,
    message: &str,
    options: &GradeOptions,
) -> Result<SubmitResponse, ApiError> {
    let dir = submission_dir(state).await?;
    write_uploads(files, dir.path(), state.settings().server().max_upload_kb)?;

    let (cancel, _guard) = request_token(state);
    let outcome = grade(state, &cancel, assignment, dir.path(), email, message, options).await?;
    Ok(submit_response(outcome))
}

fn submit_response(outcome: GradeOutcome) -> SubmitResponse {
    match outcome {
        GradeOutcome::Graded(result) => SubmitResponse {
            grading_success: true,
            grading_info: result.info,
            ..SubmitResponse::default()
        },
        GradeOutcome::Rejected(reason) => SubmitResponse {
            rejected: true,
            message: reason.to_string(),
            ..SubmitResponse::default()
        },
        GradeOutcome::SoftFailure { message, result } => SubmitResponse {
            message,
            stdout: result.stdout,
            stderr: result.stderr,
            ..SubmitResponse::default()
        },
    }
}

async fn submit(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<SubmitRequest>,
) -> ApiResult<SubmitResponse> {
    let access = require_course_role(&state, &user, &payload.course_id, CourseRole::Student).await?;
    let assignment = access.assignment(&payload.assignment_id)?;

    let mut options = GradeOptions::from_settings(state.settings());
    options.allow_late = payload.allow_late;

    let response = grade_uploads(&state, assignment, &payload.files, &user.email, &payload.message, &options).await?;
    ok(response)
}

async fn proxy_submit(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<ProxySubmitRequest>,
) -> ApiResult<SubmitResponse> {
    let access = require_course_role(&state, &user, &payload.course_id, CourseRole::Grader).await?;
    let assignment = access.assignment(&payload.assignment_id)?;
    let email = access.target_user(&state, &user, Some(&payload.proxy_email), CourseRole::Grader).await?;

    let options = GradeOptions::proxy(state.settings(), &user.email, payload.proxy_time);
    let response = grade_uploads(&state, assignment, &payload.files, &email, &payload.message, &options).await?;
    ok(response)
}

/// Grade the input files of an earlier submission again, as a new submission.
async fn proxy_resubmit(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<ProxyResubmitRequest>,
) -> ApiResult<SubmitResponse> {
    let access = require_course_role(&state, &user, &payload.course_id, CourseRole::Grader).await?;
    let assignment = access.assignment(&payload.assignment_id)?;
    let email = access.target_user(&state, &user, Some(&payload.proxy_email), CourseRole::Grader).await?;

    let short_id = payload.target_submission.as_deref().map(str::trim).filter(|id| !id.is_empty());
    let previous = state
        .backend()
        .get_submission_contents(assignment, &email, short_id)
        .await
        .map_err(|e| ApiError::internal("-056", format!("{e:#}"), "Failed to load submission"))?
        .ok_or_else(|| ApiError::not_found("-057", format!("No submission found for '{email}'.")))?;

    let message = previous.info.as_ref().map(|info| info.message.clone()).unwrap_or_default();
    let dir = submission_dir(&state).await?;
    let path = dir.path().to_path_buf();
    tokio::task::spawn_blocking(move || archive::write_gzip_files(&previous.input_files_gzip, &path))
        .await
        .map_err(|e| ApiError::internal("-058", e, "Submission write task panicked"))?
        .map_err(|e| ApiError::internal("-059", format!("{e:#}"), "Failed to write submission files"))?;

    let options = GradeOptions::proxy(state.settings(), &user.email, payload.proxy_time);
    let (cancel, _guard) = request_token(&state);
    let outcome = grade(&state, &cancel, assignment, dir.path(), &email, &message, &options).await?;
    ok(submit_response(outcome))
}

async fn lookup(
    state: &AppState,
    user: &ServerUser,
    payload: &SubmissionLookupRequest,
    min_role: CourseRole,
    others_role: CourseRole,
) -> Result<(CourseAccess, String), ApiError> {
    let access = require_course_role(state, user, &payload.course_id, min_role).await?;
    access.assignment(&payload.assignment_id)?;
    let email = access.target_user(state, user, payload.target_email.as_deref(), others_role).await?;
    Ok((access, email))
}

fn short_id(payload: &SubmissionLookupRequest) -> Option<&str> {
    payload.target_submission.as_deref().map(str::trim).filter(|id| !id.is_empty())
}

async fn peek(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<SubmissionLookupRequest>,
) -> ApiResult<PeekResponse> {
    let (access, email) = lookup(&state, &user, &payload, CourseRole::Student, CourseRole::Grader).await?;
    let assignment = access.assignment(&payload.assignment_id)?;

    let submission = state
        .backend()
        .get_submission_result(assignment, &email, short_id(&payload))
        .await
        .map_err(|e| ApiError::internal("-064", format!("{e:#}"), "Failed to load submission"))?;

    ok(PeekResponse { found_user: true, found_submission: submission.is_some(), submission })
}

async fn history(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<SubmissionLookupRequest>,
) -> ApiResult<HistoryResponse> {
    let (access, email) = lookup(&state, &user, &payload, CourseRole::Student, CourseRole::Grader).await?;
    let assignment = access.assignment(&payload.assignment_id)?;

    let history = state
        .backend()
        .get_submission_history(assignment, &email)
        .await
        .map_err(|e| ApiError::internal("-065", format!("{e:#}"), "Failed to load submission history"))?;

    ok(HistoryResponse { found_user: true, history })
}

async fn remove(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<SubmissionLookupRequest>,
) -> ApiResult<RemoveResponse> {
    let (access, email) = lookup(&state, &user, &payload, CourseRole::Admin, CourseRole::Admin).await?;
    let assignment = access.assignment(&payload.assignment_id)?;

    let found_submission = state
        .backend()
        .remove_submission(assignment, &email, short_id(&payload))
        .await
        .map_err(|e| ApiError::internal("-066", format!("{e:#}"), "Failed to remove submission"))?;

    tracing::info!(
        course_id = %assignment.course_id,
        assignment_id = %assignment.id,
        user = %email,
        by = %user.email,
        found_submission,
        "Removed submission"
    );
    ok(RemoveResponse { found_user: true, found_submission })
}

/// Regrade a selection of users. Without `wait-for-completion` the answer holds whatever
/// was already known and the rest keeps running in the background.
async fn proxy_regrade(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<ProxyRegradeRequest>,
) -> ApiResult<ProxyRegradeResponse> {
    let access = require_course_role(&state, &user, &payload.course_id, CourseRole::Grader).await?;
    let assignment = access.assignment(&payload.assignment_id)?;

    let (reference, warnings) = CourseUserReference::parse(&payload.target_users);
    let users: Vec<_> = state
        .backend()
        .get_course_users(&access.course.id)
        .await
        .map_err(|e| ApiError::internal("-067", format!("{e:#}"), "Failed to load course users"))?
        .into_values()
        .collect();
    let resolved_users = reference.resolve(&users);

    let options = RegradeOptions {
        users: resolved_users.clone(),
        regrade_after: payload.regrade_after,
        proxy_user: user.email.clone(),
        job: JobOptions {
            wait_for_completion: payload.wait_for_completion,
            dry_run: payload.dry_run,
            overwrite_records: payload.overwrite_records,
            ..JobOptions::default()
        },
    };

    let (request_cancel, _guard) = request_token(&state);
    let cancel = if payload.wait_for_completion { request_cancel } else { state.shutdown().child_token() };

    let output = regrade(&state, &cancel, assignment, options).await?;

    ok(ProxyRegradeResponse {
        complete: output.remaining == 0 && !output.canceled,
        resolved_users,
        warnings,
        results: output.results,
        work_errors: output.work_errors,
    })
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use base64::Engine;
    use tower::ServiceExt;

    use crate::test_support::{
        self, json_request, read_json, ADMIN, ASSIGNMENT_ID, COURSE_ID, GRADER, OTHER, STUDENT,
    };

    fn encoded_submission() -> serde_json::Value {
        let content = base64::engine::general_purpose::STANDARD.encode("print('hi')\n");
        serde_json::json!({"submission.py": content})
    }

    #[tokio::test]
    async fn submit_then_peek_and_history() {
        let context = test_support::test_state().await;
        let token = test_support::bearer_token(STUDENT, context.state.settings());

        let response = context
            .app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/courses/assignments/submissions/submit",
                Some(&token),
                Some(serde_json::json!({
                    "course-id": COURSE_ID,
                    "assignment-id": ASSIGNMENT_ID,
                    "message": "first try",
                    "files": encoded_submission(),
                })),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let json = read_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["content"]["grading-success"], true);
        assert_eq!(json["content"]["grading-info"]["score"], 2.0);

        let lookup = serde_json::json!({"course-id": COURSE_ID, "assignment-id": ASSIGNMENT_ID});
        let response = context
            .app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/courses/assignments/submissions/peek",
                Some(&token),
                Some(lookup.clone()),
            ))
            .await
            .expect("response");
        let json = read_json(response).await;
        assert_eq!(json["content"]["found-submission"], true);
        assert_eq!(json["content"]["submission"]["message"], "first try");

        let response = context
            .app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/courses/assignments/submissions/history",
                Some(&token),
                Some(lookup),
            ))
            .await
            .expect("response");
        let json = read_json(response).await;
        assert_eq!(json["content"]["history"].as_array().expect("history").len(), 1);
    }

    #[tokio::test]
    async fn uploads_must_stay_inside_the_submission() {
        let context = test_support::test_state().await;
        let token = test_support::bearer_token(STUDENT, context.state.settings());
        let content = base64::engine::general_purpose::STANDARD.encode("x");

        let response = context
            .app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/courses/assignments/submissions/submit",
                Some(&token),
                Some(serde_json::json!({
                    "course-id": COURSE_ID,
                    "assignment-id": ASSIGNMENT_ID,
                    "files": {"../escape.py": content},
                })),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = read_json(response).await;
        assert_eq!(json["locator"], "-055");
    }

    #[tokio::test]
    async fn students_cannot_peek_at_others() {
        let context = test_support::test_state().await;
        let token = test_support::bearer_token(STUDENT, context.state.settings());

        let response = context
            .app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/courses/assignments/submissions/peek",
                Some(&token),
                Some(serde_json::json!({
                    "course-id": COURSE_ID,
                    "assignment-id": ASSIGNMENT_ID,
                    "target-email": OTHER,
                })),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn proxy_submit_and_resubmit() {
        let context = test_support::test_state().await;
        let token = test_support::bearer_token(GRADER, context.state.settings());

        let response = context
            .app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/courses/assignments/submissions/proxy/submit",
                Some(&token),
                Some(serde_json::json!({
                    "course-id": COURSE_ID,
                    "assignment-id": ASSIGNMENT_ID,
                    "proxy-email": STUDENT,
                    "message": "late fix",
                    "files": encoded_submission(),
                })),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let json = read_json(response).await;
        assert_eq!(json["content"]["grading-info"]["proxy-user"], GRADER);
        assert_eq!(json["content"]["grading-info"]["user"], STUDENT);

        let response = context
            .app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/courses/assignments/submissions/proxy/resubmit",
                Some(&token),
                Some(serde_json::json!({
                    "course-id": COURSE_ID,
                    "assignment-id": ASSIGNMENT_ID,
                    "proxy-email": STUDENT,
                })),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let json = read_json(response).await;
        assert_eq!(json["content"]["grading-success"], true);
        assert_eq!(json["content"]["grading-info"]["message"], "late fix");

        let assignment = test_support::assignment(&context.state).await;
        let history = context
            .state
            .backend()
            .get_submission_history(&assignment, STUDENT)
            .await
            .expect("history");
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn proxy_regrade_waits_when_asked() {
        let context = test_support::test_state().await;
        let assignment = test_support::assignment(&context.state).await;
        test_support::store_submission(&context.state, &assignment, STUDENT, "100").await;
        let token = test_support::bearer_token(GRADER, context.state.settings());

        let response = context
            .app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/courses/assignments/submissions/proxy/regrade",
                Some(&token),
                Some(serde_json::json!({
                    "course-id": COURSE_ID,
                    "assignment-id": ASSIGNMENT_ID,
                    "target-users": ["student", "bogus-role"],
                    "wait-for-completion": true,
                })),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let json = read_json(response).await;
        assert_eq!(json["content"]["complete"], true);
        assert_eq!(json["content"]["resolved-users"], serde_json::json!([STUDENT]));
        assert_eq!(json["content"]["warnings"].as_array().expect("warnings").len(), 1);
        assert!(json["content"]["results"][STUDENT].is_object());
    }

    #[tokio::test]
    async fn remove_needs_course_admin() {
        let context = test_support::test_state().await;
        let assignment = test_support::assignment(&context.state).await;
        test_support::store_submission(&context.state, &assignment, STUDENT, "100").await;
        let body = serde_json::json!({
            "course-id": COURSE_ID,
            "assignment-id": ASSIGNMENT_ID,
            "target-email": STUDENT,
        });

        let grader = test_support::bearer_token(GRADER, context.state.settings());
        let response = context
            .app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/courses/assignments/submissions/remove",
                Some(&grader),
                Some(body.clone()),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let admin = test_support::bearer_token(ADMIN, context.state.settings());
        let response = context
            .app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/courses/assignments/submissions/remove",
                Some(&admin),
                Some(body),
            ))
            .await
            .expect("response");
        let json = read_json(response).await;
        assert_eq!(json["content"]["found-submission"], true);
    }
}
