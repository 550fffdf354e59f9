pub(crate) mod admin;
pub(crate) mod analysis;
pub(crate) mod auth;
pub(crate) mod errors;
pub(crate) mod guards;
pub(crate) mod handlers;
pub(crate) mod router;
pub(crate) mod submissions;
pub(crate) mod users;

use axum::Json;

use crate::api::errors::ApiError;
use crate::schemas::Envelope;

pub(crate) type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

pub(crate) fn ok<T>(content: T) -> ApiResult<T> {
    Ok(Json(Envelope::ok(content)))
}
