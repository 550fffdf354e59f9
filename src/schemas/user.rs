use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::Timestamp;
use crate::db::types::{CourseRole, ServerRole};
use crate::models::user::{ServerUser, TokenSource, UserToken};

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct UserResponse {
    pub(crate) email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) name: Option<String>,
    pub(crate) role: ServerRole,
    pub(crate) courses: BTreeMap<String, CourseRole>,
}

impl UserResponse {
    pub(crate) fn from_user(user: &ServerUser) -> Self {
        Self {
            email: user.email.clone(),
            name: user.name.clone(),
            role: user.role,
            courses: user.course_info.iter().map(|(id, info)| (id.clone(), info.role)).collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct TargetUserRequest {
    #[serde(default)]
    pub(crate) target_email: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct TokenCreateRequest {
    #[serde(default)]
    pub(crate) target_email: Option<String>,
    #[serde(default)]
    #[validate(length(max = 100, message = "token name must be at most 100 characters"))]
    pub(crate) name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct TokenCreateResponse {
    pub(crate) token_id: String,
    /// Only ever returned here.
    pub(crate) token_cleartext: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct TokenDeleteRequest {
    #[serde(default)]
    pub(crate) target_email: Option<String>,
    pub(crate) token_id: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct TokenDeleteResponse {
    pub(crate) found: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct TokenInfo {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) source: TokenSource,
    pub(crate) creation_time: Timestamp,
    pub(crate) access_time: Timestamp,
}

impl From<&UserToken> for TokenInfo {
    fn from(token: &UserToken) -> Self {
        Self {
            id: token.id.clone(),
            name: token.name.clone(),
            source: token.source,
            creation_time: token.created,
            access_time: token.accessed,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct TokenListResponse {
    pub(crate) tokens: Vec<TokenInfo>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct PasswordChangeRequest {
    #[validate(length(min = 8, message = "password must be at least 8 characters long"))]
    pub(crate) new_pass: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct PasswordResponse {
    pub(crate) success: bool,
}
