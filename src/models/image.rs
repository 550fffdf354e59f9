use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::ModelError;

pub(crate) const DEFAULT_IMAGE: &str = "edulinq/autograder/internal.base";

/// `[op, args...]` where op is one of `cp`, `mv`, `mkdir`, `rm`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct FileOperation(pub(crate) Vec<String>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileOperationKind {
    Copy,
    Move,
    MakeDir,
    Remove,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ImageInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub(crate) image: String,
    #[serde(rename = "pre-static-docker-commands", default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) pre_static_docker_commands: Vec<String>,
    #[serde(rename = "post-static-docker-commands", default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) post_static_docker_commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) invocation: Vec<String>,
    #[serde(rename = "static-files", default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) static_files: Vec<String>,
    #[serde(rename = "pre-static-files-ops", default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) pre_static_file_ops: Vec<FileOperation>,
    #[serde(rename = "post-static-files-ops", default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) post_static_file_ops: Vec<FileOperation>,
    #[serde(rename = "post-submission-files-ops", default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) post_submission_file_ops: Vec<FileOperation>,
    #[serde(rename = "max-runtime-secs", default, skip_serializing_if = "is_zero")]
    pub(crate) max_runtime_secs: u64,
}

/// The part of the image info handed to the grader at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct GradingConfig {
    pub(crate) name: String,
    #[serde(rename = "post-submission-files-ops", default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) post_submission_file_ops: Vec<FileOperation>,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl FileOperation {
    pub(crate) fn new<S: Into<String>>(parts: impl IntoIterator<Item = S>) -> Self {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub(crate) fn kind(&self) -> Option<FileOperationKind> {
        match self.0.first().map(|op| op.to_lowercase()).as_deref() {
            Some("cp") => Some(FileOperationKind::Copy),
            Some("mv") => Some(FileOperationKind::Move),
            Some("mkdir") => Some(FileOperationKind::MakeDir),
            Some("rm") => Some(FileOperationKind::Remove),
            _ => None,
        }
    }

    pub(crate) fn args(&self) -> &[String] {
        self.0.get(1..).unwrap_or_default()
    }

    pub(crate) fn validate(&self) -> Result<(), ModelError> {
        let Some(kind) = self.kind() else {
            return Err(ModelError::InvalidImage(format!("unknown file operation: '{self}'")));
        };

        let expected = match kind {
            FileOperationKind::Copy | FileOperationKind::Move => 2,
            FileOperationKind::MakeDir | FileOperationKind::Remove => 1,
        };

        if self.args().len() != expected {
            return Err(ModelError::InvalidImage(format!(
                "file operation '{self}' expects {expected} argument(s), found {}",
                self.args().len()
            )));
        }

        for arg in self.args() {
            check_relative_path(arg)?;
        }

        Ok(())
    }
}

impl fmt::Display for FileOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

fn check_relative_path(value: &str) -> Result<(), ModelError> {
    let path = Path::new(value);
    if value.trim().is_empty() || path.is_absolute() {
        return Err(ModelError::InvalidImage(format!("paths must be relative, found '{value}'")));
    }

    if path.components().any(|component| matches!(component, Component::ParentDir)) {
        return Err(ModelError::InvalidImage(format!(
            "paths must not leave their base dir, found '{value}'"
        )));
    }

    Ok(())
}

impl ImageInfo {
    /// Fill defaults and check the invariants. `server_max_secs` caps the runtime.
    pub(crate) fn validate(&mut self, server_max_secs: u64) -> Result<(), ModelError> {
        self.image = self.image.trim().to_string();
        if self.image.is_empty() && self.invocation.is_empty() {
            return Err(ModelError::InvalidImage(String::from(
                "image and invocation cannot both be empty",
            )));
        }

        if self.image.is_empty() {
            self.image = DEFAULT_IMAGE.to_string();
        }

        for static_file in &self.static_files {
            check_relative_path(static_file)?;
        }

        for op in self
            .pre_static_file_ops
            .iter()
            .chain(&self.post_static_file_ops)
            .chain(&self.post_submission_file_ops)
        {
            op.validate()?;
        }

        if self.max_runtime_secs > server_max_secs {
            tracing::warn!(
                assignment_max = self.max_runtime_secs,
                server_max = server_max_secs,
                "Assignment max runtime is above the server max, lowering it"
            );
            self.max_runtime_secs = server_max_secs;
        }

        if self.max_runtime_secs == 0 {
            self.max_runtime_secs = server_max_secs;
        }

        Ok(())
    }

    /// Stable hash of everything that goes into an image build.
    pub(crate) fn hash(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(encoded))
    }

    pub(crate) fn grading_config(&self, name: &str) -> GradingConfig {
        GradingConfig {
            name: name.to_string(),
            post_submission_file_ops: self.post_submission_file_ops.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation_only() -> ImageInfo {
        ImageInfo { invocation: vec![String::from("./grader.sh")], ..ImageInfo::default() }
    }

    #[test]
    fn image_or_invocation_is_required() {
        assert!(ImageInfo::default().validate(300).is_err());

        let mut info = invocation_only();
        info.validate(300).expect("valid");
        assert_eq!(info.image, DEFAULT_IMAGE);
    }

    #[test]
    fn runtime_is_clamped_to_server_max() {
        let mut info = invocation_only();
        info.max_runtime_secs = 1000;
        info.validate(300).expect("valid");
        assert_eq!(info.max_runtime_secs, 300);

        let mut info = invocation_only();
        info.validate(300).expect("valid");
        assert_eq!(info.max_runtime_secs, 300);

        let mut info = invocation_only();
        info.max_runtime_secs = 10;
        info.validate(300).expect("valid");
        assert_eq!(info.max_runtime_secs, 10);
    }

    #[test]
    fn static_files_must_be_relative() {
        let mut info = invocation_only();
        info.static_files = vec![String::from("/etc/passwd")];
        assert!(info.validate(300).is_err());

        let mut info = invocation_only();
        info.static_files = vec![String::from("../secret")];
        assert!(info.validate(300).is_err());
    }

    #[test]
    fn file_operations_check_arity() {
        assert!(FileOperation::new(["cp", "a", "b"]).validate().is_ok());
        assert!(FileOperation::new(["MKDIR", "out"]).validate().is_ok());
        assert!(FileOperation::new(["cp", "a"]).validate().is_err());
        assert!(FileOperation::new(["chmod", "a"]).validate().is_err());
        assert!(FileOperation::new(Vec::<String>::new()).validate().is_err());
    }

    #[test]
    fn hash_changes_with_content() {
        let first = invocation_only();
        let mut second = invocation_only();
        assert_eq!(first.hash(), second.hash());

        second.static_files.push(String::from("grader.py"));
        assert_ne!(first.hash(), second.hash());
    }
}
