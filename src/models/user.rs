use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::time::Timestamp;
use crate::db::types::{CourseRole, ServerRole};
use crate::models::{validate_email, validate_id, ModelError};

pub(crate) const ROOT_EMAIL: &str = "root";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum TokenSource {
    #[default]
    Unknown,
    Server,
    User,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct UserToken {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) source: TokenSource,
    /// Hex sha256 of the cleartext handed to the user once.
    #[serde(rename = "hex-digest")]
    pub(crate) hex_digest: String,
    #[serde(rename = "creation-time")]
    pub(crate) created: Timestamp,
    #[serde(rename = "access-time", default)]
    pub(crate) accessed: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub(crate) struct UserCourseInfo {
    pub(crate) role: CourseRole,
    #[serde(rename = "lms-id", default, skip_serializing_if = "Option::is_none")]
    pub(crate) lms_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ServerUser {
    pub(crate) email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) name: Option<String>,
    pub(crate) role: ServerRole,
    #[serde(rename = "password-hash", default, skip_serializing_if = "Option::is_none")]
    pub(crate) password_hash: Option<String>,
    #[serde(default)]
    pub(crate) tokens: Vec<UserToken>,
    #[serde(rename = "course-info", default)]
    pub(crate) course_info: BTreeMap<String, UserCourseInfo>,
}

/// A server user seen through one course.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CourseUser {
    pub(crate) email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) name: Option<String>,
    pub(crate) role: CourseRole,
    #[serde(rename = "lms-id", default, skip_serializing_if = "Option::is_none")]
    pub(crate) lms_id: Option<String>,
}

impl ServerUser {
    pub(crate) fn new(email: &str, role: ServerRole) -> Self {
        Self {
            email: email.trim().to_lowercase(),
            name: None,
            role,
            password_hash: None,
            tokens: Vec::new(),
            course_info: BTreeMap::new(),
        }
    }

    pub(crate) fn with_course(mut self, course_id: &str, role: CourseRole) -> Self {
        self.course_info
            .insert(course_id.to_string(), UserCourseInfo { role, lms_id: None });
        self
    }

    pub(crate) fn is_root(&self) -> bool {
        self.role == ServerRole::Root
    }

    /// Normalizes in place. The root user is the only account without a real address.
    pub(crate) fn validate(&mut self) -> Result<(), ModelError> {
        if self.email.trim() == ROOT_EMAIL {
            if self.role != ServerRole::Root {
                return Err(ModelError::InvalidEmail(self.email.clone()));
            }
            self.email = ROOT_EMAIL.to_string();
        } else {
            self.email = validate_email(&self.email)?;
        }

        if self.role == ServerRole::Unknown {
            return Err(ModelError::UnknownRole(format!("server role of '{}'", self.email)));
        }

        self.name = self
            .name
            .take()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());

        let mut normalized = BTreeMap::new();
        for (course_id, info) in std::mem::take(&mut self.course_info) {
            if info.role == CourseRole::Unknown {
                return Err(ModelError::UnknownRole(format!(
                    "course role of '{}' in '{course_id}'",
                    self.email
                )));
            }
            normalized.insert(validate_id(&course_id)?, info);
        }
        self.course_info = normalized;

        Ok(())
    }

    pub(crate) fn course_role(&self, course_id: &str) -> Option<CourseRole> {
        self.course_info.get(course_id).map(|info| info.role)
    }

    /// Server admins act as course owners everywhere.
    pub(crate) fn effective_course_role(&self, course_id: &str) -> CourseRole {
        if self.role >= ServerRole::Admin {
            return CourseRole::Owner;
        }

        self.course_role(course_id).unwrap_or(CourseRole::Unknown)
    }

    pub(crate) fn to_course_user(&self, course_id: &str) -> Option<CourseUser> {
        let info = self.course_info.get(course_id)?;
        Some(CourseUser {
            email: self.email.clone(),
            name: self.name.clone(),
            role: info.role,
            lms_id: info.lms_id.clone(),
        })
    }

    pub(crate) fn find_token_mut(&mut self, hex_digest: &str) -> Option<&mut UserToken> {
        self.tokens.iter_mut().find(|token| token.hex_digest == hex_digest)
    }

    /// Returns whether a token with this id existed.
    pub(crate) fn remove_token(&mut self, token_id: &str) -> bool {
        let before = self.tokens.len();
        self.tokens.retain(|token| token.id != token_id);
        before != self.tokens.len()
    }
}

impl CourseUser {
    pub(crate) fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.email)
    }
}
