use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};

use crate::api::errors::ApiError;
use crate::api::guards::CurrentUser;
use crate::api::{ok, ApiResult};
use crate::core::security;
use crate::core::state::AppState;
use crate::core::time::Timestamp;
use crate::schemas::auth::{LoginRequest, TokenResponse};
use crate::schemas::user::UserResponse;

pub(crate) fn router() -> Router<AppState> {
    Router::new().route("/login", post(login)).route("/me", get(me))
}

async fn login(State(state): State<AppState>, Json(payload): Json<LoginRequest>) -> ApiResult<TokenResponse> {
    let email = payload.email.trim().to_lowercase();

    let user = state
        .backend()
        .get_server_user(&email)
        .await
        .map_err(|e| ApiError::internal("-010", format!("{e:#}"), "Failed to load user"))?;

    let Some(mut user) = user.filter(|user| !user.is_root()) else {
        return Err(ApiError::unauthorized("-011"));
    };

    let authenticated = match (payload.password.as_deref(), payload.token.as_deref()) {
        (Some(password), _) => match user.password_hash.as_deref() {
            Some(hash) => security::verify_password(password, hash)
                .map_err(|e| ApiError::internal("-012", e, "Failed to verify password"))?,
            None => false,
        },
        (None, Some(token)) => {
            let digest = security::sha256_hex(token.trim());
            let found = user.find_token_mut(&digest).map(|found| found.accessed = Timestamp::now()).is_some();
            if found {
                state
                    .backend()
                    .upsert_users(std::slice::from_ref(&user))
                    .await
                    .map_err(|e| ApiError::internal("-013", format!("{e:#}"), "Failed to record token use"))?;
            }
            found
        }
        (None, None) => {
            return Err(ApiError::bad_request("-014", "A password or a token is required."));
        }
    };

    if !authenticated {
        tracing::info!(user = %email, "Rejected login");
        return Err(ApiError::unauthorized("-015"));
    }

    let access_token = security::create_access_token(&user.email, state.settings(), None)
        .map_err(|e| ApiError::internal("-016", e, "Failed to create access token"))?;

    ok(TokenResponse { access_token, token_type: String::from("bearer") })
}

async fn me(CurrentUser(user): CurrentUser) -> ApiResult<UserResponse> {
    ok(UserResponse::from_user(&user))
}
