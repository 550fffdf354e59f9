use axum::{extract::State, routing::post, Json, Router};

use crate::api::errors::ApiError;
use crate::api::guards::{require_course_role, require_server_role, CurrentUser};
use crate::api::{ok, ApiResult};
use crate::core::state::AppState;
use crate::core::time::Timestamp;
use crate::db::types::{CourseRole, ServerRole};
use crate::schemas::admin::{FetchLogsRequest, FetchLogsResponse, UpdateCourseRequest, UpdateCourseResponse};
use crate::services::course_loader;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/update/course", post(update_course))
        .route("/logs/fetch", post(fetch_logs))
}

async fn update_course(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<UpdateCourseRequest>,
) -> ApiResult<UpdateCourseResponse> {
    let access = require_course_role(&state, &user, &payload.course_id, CourseRole::Admin).await?;

    let course_updated =
        course_loader::update_course(&state, &access.course.id, payload.clear, payload.source.as_deref())
            .await
            .map_err(|e| ApiError::internal("-040", format!("{e:#}"), "Failed to update course"))?;

    tracing::info!(course_id = %access.course.id, user = %user.email, course_updated, "Course update requested");
    ok(UpdateCourseResponse { course_updated })
}

/// Course admins may read their own course's records. Anything wider needs a server admin.
async fn fetch_logs(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<FetchLogsRequest>,
) -> ApiResult<FetchLogsResponse> {
    let (query, mut error_messages) = payload.query.parse(Timestamp::now());

    match query.course_id.as_deref() {
        Some(course_id) => {
            let access = match require_course_role(&state, &user, course_id, CourseRole::Admin).await {
                Ok(access) => Some(access),
                Err(ApiError::NotFound(_, message)) => {
                    error_messages.push(message);
                    None
                }
                Err(err) => return Err(err),
            };

            if let (Some(access), Some(assignment_id)) = (access, query.assignment_id.as_deref()) {
                if access.course.assignment(assignment_id).is_none() {
                    error_messages.push(format!("Could not find assignment: '{assignment_id}'."));
                }
            }
        }
        None => require_server_role(&user, ServerRole::Admin)?,
    }

    if let Some(email) = query.user.as_deref() {
        let found = state
            .backend()
            .get_server_user(email)
            .await
            .map_err(|e| ApiError::internal("-041", format!("{e:#}"), "Failed to load user"))?;
        if found.is_none() {
            error_messages.push(format!("Could not find user: '{email}'."));
        }
    }

    if !error_messages.is_empty() {
        return ok(FetchLogsResponse { error_messages, results: Vec::new() });
    }

    let results = state
        .backend()
        .get_log_records(&query)
        .await
        .map_err(|e| ApiError::internal("-042", format!("{e:#}"), "Failed to fetch log records"))?;

    ok(FetchLogsResponse { error_messages, results })
}
