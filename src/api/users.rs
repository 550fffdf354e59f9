use axum::{extract::State, routing::post, Json, Router};
use uuid::Uuid;
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::guards::{server_target_user, CurrentUser};
use crate::api::{ok, ApiResult};
use crate::core::security;
use crate::core::state::AppState;
use crate::core::time::Timestamp;
use crate::models::user::{ServerUser, TokenSource, UserToken};
use crate::schemas::user::{
    PasswordChangeRequest, PasswordResponse, TargetUserRequest, TokenCreateRequest, TokenCreateResponse,
    TokenDeleteRequest, TokenDeleteResponse, TokenInfo, TokenListResponse,
};
use crate::services::email::EmailMessage;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/tokens/create", post(create_token))
        .route("/tokens/delete", post(delete_token))
        .route("/tokens/list", post(list_tokens))
        .route("/password/change", post(change_password))
        .route("/password/reset", post(reset_password))
}

async fn save_user(state: &AppState, user: &ServerUser) -> Result<(), ApiError> {
    state
        .backend()
        .upsert_users(std::slice::from_ref(user))
        .await
        .map_err(|e| ApiError::internal("-043", format!("{e:#}"), "Failed to save user"))
}

async fn create_token(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<TokenCreateRequest>,
) -> ApiResult<TokenCreateResponse> {
    payload.validate().map_err(|e| ApiError::bad_request("-049", e.to_string()))?;

    let mut target = server_target_user(&state, &user, payload.target_email.as_deref()).await?;
    let source = if target.email == user.email { TokenSource::User } else { TokenSource::Admin };

    let cleartext = security::generate_token_secret();
    let token = UserToken {
        id: Uuid::new_v4().to_string(),
        name: payload.name.trim().to_string(),
        source,
        hex_digest: security::sha256_hex(&cleartext),
        created: Timestamp::now(),
        accessed: Timestamp::zero(),
    };
    let token_id = token.id.clone();
    target.tokens.push(token);
    save_user(&state, &target).await?;

    tracing::info!(user = %target.email, by = %user.email, token_id = %token_id, "Created API token");
    ok(TokenCreateResponse { token_id, token_cleartext: cleartext })
}

async fn delete_token(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<TokenDeleteRequest>,
) -> ApiResult<TokenDeleteResponse> {
    let target = server_target_user(&state, &user, payload.target_email.as_deref()).await?;

    let found = state
        .backend()
        .delete_user_token(&target.email, payload.token_id.trim())
        .await
        .map_err(|e| ApiError::internal("-044", format!("{e:#}"), "Failed to delete token"))?;

    ok(TokenDeleteResponse { found })
}

async fn list_tokens(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<TargetUserRequest>,
) -> ApiResult<TokenListResponse> {
    let target = server_target_user(&state, &user, payload.target_email.as_deref()).await?;
    ok(TokenListResponse { tokens: target.tokens.iter().map(TokenInfo::from).collect() })
}

async fn change_password(
    State(state): State<AppState>,
    CurrentUser(mut user): CurrentUser,
    Json(payload): Json<PasswordChangeRequest>,
) -> ApiResult<PasswordResponse> {
    payload.validate().map_err(|e| ApiError::bad_request("-045", e.to_string()))?;

    let hash = security::hash_password(&payload.new_pass)
        .map_err(|e| ApiError::internal("-046", e, "Failed to hash password"))?;
    user.password_hash = Some(hash);
    save_user(&state, &user).await?;

    ok(PasswordResponse { success: true })
}

/// A fresh random password, emailed to the target. The old one stops working at once.
async fn reset_password(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<TargetUserRequest>,
) -> ApiResult<PasswordResponse> {
    let mut target = server_target_user(&state, &user, payload.target_email.as_deref()).await?;

    let password = security::generate_password();
    let hash = security::hash_password(&password)
        .map_err(|e| ApiError::internal("-047", e, "Failed to hash password"))?;
    target.password_hash = Some(hash);
    save_user(&state, &target).await?;

    let body = format!("Hello,\n\nYour autograder password has been reset.\nNew password: {password}\n");
    let message = EmailMessage::text(&[target.email.clone()], "Autograder Password Reset", &body);
    state
        .mailer()
        .send(message)
        .await
        .map_err(|e| ApiError::internal("-048", format!("{e:#}"), "Failed to send password email"))?;

    tracing::info!(user = %target.email, by = %user.email, "Reset password");
    ok(PasswordResponse { success: true })
}
