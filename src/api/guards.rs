use async_trait::async_trait;
use axum::extract::{FromRequestParts, State};
use axum::http::{header, request::Parts};

use crate::api::errors::ApiError;
use crate::core::{security, state::AppState};
use crate::db::types::{CourseRole, ServerRole};
use crate::models::assignment::Assignment;
use crate::models::course::Course;
use crate::models::user::ServerUser;

pub(crate) struct CurrentUser(pub(crate) ServerUser);

/// A caller's view of one course.
#[derive(Debug, Clone)]
pub(crate) struct CourseAccess {
    pub(crate) course: Course,
    pub(crate) role: CourseRole,
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let State(app_state) = State::<AppState>::from_request_parts(parts, state)
            .await
            .map_err(|e| ApiError::internal("-020", e, "Failed to access application state"))?;

        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(ApiError::unauthorized("-021"))?;

        let claims = security::verify_token(token, app_state.settings())
            .map_err(|_| ApiError::unauthorized("-022"))?;

        let user = app_state
            .backend()
            .get_server_user(&claims.sub)
            .await
            .map_err(|e| ApiError::internal("-023", format!("{e:#}"), "Failed to load user"))?;

        let Some(user) = user else {
            return Err(ApiError::unauthorized("-024"));
        };

        if user.is_root() {
            return Err(ApiError::unauthorized("-025"));
        }

        Ok(CurrentUser(user))
    }
}

pub(crate) fn require_server_role(user: &ServerUser, role: ServerRole) -> Result<(), ApiError> {
    if user.role >= role {
        return Ok(());
    }

    Err(ApiError::forbidden("-026", format!("Server role '{}' or higher is required.", role.as_str())))
}

pub(crate) async fn require_course_role(
    state: &AppState,
    user: &ServerUser,
    course_id: &str,
    role: CourseRole,
) -> Result<CourseAccess, ApiError> {
    let course_id = course_id.trim().to_lowercase();
    let course = state
        .backend()
        .get_course(&course_id)
        .await
        .map_err(|e| ApiError::internal("-027", format!("{e:#}"), "Failed to load course"))?
        .ok_or_else(|| ApiError::not_found("-028", format!("Unknown course: '{course_id}'.")))?;

    let current = user.effective_course_role(&course.id);
    if current == CourseRole::Unknown {
        return Err(ApiError::forbidden("-029", format!("User is not enrolled in '{}'.", course.id)));
    }

    if current < role {
        return Err(ApiError::forbidden(
            "-030",
            format!("Course role '{}' or higher is required.", role.as_str()),
        ));
    }

    Ok(CourseAccess { course, role: current })
}

impl CourseAccess {
    pub(crate) fn assignment(&self, assignment_id: &str) -> Result<&Assignment, ApiError> {
        let assignment_id = assignment_id.trim().to_lowercase();
        self.course.assignment(&assignment_id).ok_or_else(|| {
            ApiError::not_found("-031", format!("Unknown assignment: '{assignment_id}'."))
        })
    }

    /// The email an operation applies to. Acting on someone else needs `others_role`, and
    /// the target must be enrolled in the course.
    pub(crate) async fn target_user(
        &self,
        state: &AppState,
        user: &ServerUser,
        target: Option<&str>,
        others_role: CourseRole,
    ) -> Result<String, ApiError> {
        let target = target.map(|value| value.trim().to_lowercase()).filter(|value| !value.is_empty());
        let Some(target) = target.filter(|value| *value != user.email) else {
            return Ok(user.email.clone());
        };

        if self.role < others_role {
            return Err(ApiError::forbidden(
                "-032",
                format!("Course role '{}' or higher is required to act on other users.", others_role.as_str()),
            ));
        }

        let enrolled = state
            .backend()
            .get_server_user(&target)
            .await
            .map_err(|e| ApiError::internal("-033", format!("{e:#}"), "Failed to load target user"))?
            .and_then(|found| found.course_role(&self.course.id));

        if enrolled.is_none() {
            return Err(ApiError::not_found("-034", format!("Unknown user in course: '{target}'.")));
        }

        Ok(target)
    }
}

/// The email a server-level operation applies to. Others need a server admin.
pub(crate) async fn server_target_user(
    state: &AppState,
    user: &ServerUser,
    target: Option<&str>,
) -> Result<ServerUser, ApiError> {
    let target = target.map(|value| value.trim().to_lowercase()).filter(|value| !value.is_empty());
    let Some(target) = target.filter(|value| *value != user.email) else {
        return Ok(user.clone());
    };

    require_server_role(user, ServerRole::Admin)?;

    let found = state
        .backend()
        .get_server_user(&target)
        .await
        .map_err(|e| ApiError::internal("-035", format!("{e:#}"), "Failed to load target user"))?;

    match found {
        Some(found) if !found.is_root() => Ok(found),
        _ => Err(ApiError::not_found("-036", format!("Unknown user: '{target}'."))),
    }
}
