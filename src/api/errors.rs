use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::grading::GradeError;
use crate::jobs::JobError;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    success: bool,
    locator: &'static str,
    message: String,
}

/// An error surfaced to API callers. The locator is stable across releases so clients
/// can match on it.
#[derive(Debug)]
pub(crate) enum ApiError {
    Unauthorized(&'static str, String),
    Forbidden(&'static str, String),
    BadRequest(&'static str, String),
    NotFound(&'static str, String),
    Conflict(&'static str, String),
    PayloadTooLarge(&'static str, String),
    Unavailable(&'static str, String),
    Internal(&'static str, String),
}

impl ApiError {
    /// Log the underlying error with context and return an `Internal` variant.
    pub(crate) fn internal(locator: &'static str, err: impl std::fmt::Display, context: &str) -> Self {
        tracing::error!(error = %err, locator, "{context}");
        Self::Internal(locator, context.to_string())
    }

    pub(crate) fn unauthorized(locator: &'static str) -> Self {
        Self::Unauthorized(locator, String::from("Invalid authentication credentials"))
    }

    pub(crate) fn forbidden(locator: &'static str, message: impl Into<String>) -> Self {
        Self::Forbidden(locator, message.into())
    }

    pub(crate) fn bad_request(locator: &'static str, message: impl Into<String>) -> Self {
        Self::BadRequest(locator, message.into())
    }

    pub(crate) fn not_found(locator: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound(locator, message.into())
    }

    pub(crate) fn locator(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(locator, _)
            | ApiError::Forbidden(locator, _)
            | ApiError::BadRequest(locator, _)
            | ApiError::NotFound(locator, _)
            | ApiError::Conflict(locator, _)
            | ApiError::PayloadTooLarge(locator, _)
            | ApiError::Unavailable(locator, _)
            | ApiError::Internal(locator, _) => locator,
        }
    }
}

impl<I: Ord, O> From<JobError<I, O>> for ApiError {
    fn from(err: JobError<I, O>) -> Self {
        match err {
            JobError::Locked(key) => {
                ApiError::Conflict("-060", format!("Another job is already running for '{key}'."))
            }
            JobError::InvalidPoolSize(size) => {
                ApiError::internal("-061", format!("invalid pool size {size}"), "Failed to start job")
            }
            JobError::Storage(err) => ApiError::internal("-062", format!("{err:#}"), "Failed to run job"),
            JobError::Canceled { job, partial } => {
                tracing::warn!(job = %job, remaining = partial.remaining, "Job was canceled before it finished");
                ApiError::Unavailable(
                    "-068",
                    format!("Job '{job}' was canceled with {} item(s) unfinished.", partial.remaining),
                )
            }
        }
    }
}

impl From<GradeError> for ApiError {
    fn from(err: GradeError) -> Self {
        ApiError::internal("-063", err, "Failed to grade submission")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, locator, message) = match self {
            ApiError::Unauthorized(locator, message) => {
                let status = StatusCode::UNAUTHORIZED;
                let mut response =
                    (status, Json(ErrorResponse { success: false, locator, message })).into_response();
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
                return response;
            }
            ApiError::Forbidden(locator, message) => (StatusCode::FORBIDDEN, locator, message),
            ApiError::BadRequest(locator, message) => (StatusCode::BAD_REQUEST, locator, message),
            ApiError::NotFound(locator, message) => (StatusCode::NOT_FOUND, locator, message),
            ApiError::Conflict(locator, message) => (StatusCode::CONFLICT, locator, message),
            ApiError::PayloadTooLarge(locator, message) => (StatusCode::PAYLOAD_TOO_LARGE, locator, message),
            ApiError::Unavailable(locator, message) => (StatusCode::SERVICE_UNAVAILABLE, locator, message),
            ApiError::Internal(locator, message) => {
                tracing::error!(error = %message, locator, "Internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, locator, message)
            }
        };

        (status, Json(ErrorResponse { success: false, locator, message })).into_response()
    }
}
