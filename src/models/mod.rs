pub(crate) mod analysis;
pub(crate) mod assignment;
pub(crate) mod course;
pub(crate) mod grading;
pub(crate) mod image;
pub(crate) mod late;
pub(crate) mod logs;
pub(crate) mod scheduled_time;
pub(crate) mod scoring;
pub(crate) mod tasks;
pub(crate) mod user;
pub(crate) mod user_reference;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum ModelError {
    #[error("IDs must not be empty")]
    EmptyId,
    #[error("IDs must only contain letters, digits, and '._-', found '{0}'")]
    InvalidId(String),
    #[error("invalid image info: {0}")]
    InvalidImage(String),
    #[error("invalid time spec: {0}")]
    InvalidTime(String),
    #[error("invalid task: {0}")]
    InvalidTask(String),
    #[error("invalid late policy: {0}")]
    InvalidLatePolicy(String),
    #[error("invalid submission limit: {0}")]
    InvalidLimit(String),
    #[error("unknown role: '{0}'")]
    UnknownRole(String),
    #[error("invalid email: '{0}'")]
    InvalidEmail(String),
}

pub(crate) fn is_id_char(value: char) -> bool {
    value.is_ascii_alphanumeric() || matches!(value, '.' | '_' | '-')
}

/// Normalize (trim, lowercase) and check an id.
pub(crate) fn validate_id(id: &str) -> Result<String, ModelError> {
    let normalized = id.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(ModelError::EmptyId);
    }

    if !normalized.chars().all(is_id_char) {
        return Err(ModelError::InvalidId(id.to_string()));
    }

    Ok(normalized)
}

pub(crate) fn validate_email(email: &str) -> Result<String, ModelError> {
    let normalized = email.trim().to_lowercase();
    let valid = normalized.split_once('@').is_some_and(|(local, domain)| {
        !local.is_empty() && !domain.is_empty() && !normalized.contains(char::is_whitespace)
    });

    if valid {
        Ok(normalized)
    } else {
        Err(ModelError::InvalidEmail(email.to_string()))
    }
}
