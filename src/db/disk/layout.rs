use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::models::analysis::PairwiseKey;
use crate::models::assignment::ASSIGNMENT_CONFIG_FILENAME;
use crate::models::course::COURSE_CONFIG_FILENAME;
use crate::models::validate_id;

const USERS_FILENAME: &str = "users.json";
const TASKS_FILENAME: &str = "tasks.json";
const LOG_FILENAME: &str = "log.jsonl";
const METRICS_FILENAME: &str = "metrics.jsonl";
const COMPLETIONS_FILENAME: &str = "task-completions.json";

/// Where each record lives under the database dir.
#[derive(Debug, Clone)]
pub(super) struct Layout {
    base: PathBuf,
}

impl Layout {
    pub(super) fn new(base: &Path) -> Self {
        Self { base: base.to_path_buf() }
    }

    pub(super) fn courses_dir(&self) -> PathBuf {
        self.base.join("courses")
    }

    pub(super) fn course_dir(&self, course_id: &str) -> anyhow::Result<PathBuf> {
        Ok(self.courses_dir().join(validate_id(course_id)?))
    }

    pub(super) fn course_file(&self, course_id: &str) -> anyhow::Result<PathBuf> {
        Ok(self.course_dir(course_id)?.join(COURSE_CONFIG_FILENAME))
    }

    pub(super) fn assignments_dir(&self, course_id: &str) -> anyhow::Result<PathBuf> {
        Ok(self.course_dir(course_id)?.join("assignments"))
    }

    pub(super) fn assignment_file(&self, course_id: &str, assignment_id: &str) -> anyhow::Result<PathBuf> {
        Ok(self
            .assignments_dir(course_id)?
            .join(validate_id(assignment_id)?)
            .join(ASSIGNMENT_CONFIG_FILENAME))
    }

    pub(super) fn user_submissions_dir(
        &self,
        course_id: &str,
        assignment_id: &str,
        email: &str,
    ) -> anyhow::Result<PathBuf> {
        Ok(self
            .course_dir(course_id)?
            .join("submissions")
            .join(validate_id(assignment_id)?)
            .join(path_safe_email(email)?))
    }

    pub(super) fn completions_file(&self, course_id: &str) -> anyhow::Result<PathBuf> {
        Ok(self.course_dir(course_id)?.join(COMPLETIONS_FILENAME))
    }

    pub(super) fn users_file(&self) -> PathBuf {
        self.base.join(USERS_FILENAME)
    }

    pub(super) fn tasks_file(&self) -> PathBuf {
        self.base.join(TASKS_FILENAME)
    }

    pub(super) fn log_file(&self) -> PathBuf {
        self.base.join(LOG_FILENAME)
    }

    pub(super) fn metrics_file(&self) -> PathBuf {
        self.base.join(METRICS_FILENAME)
    }

    pub(super) fn analysis_dir(&self) -> PathBuf {
        self.base.join("analysis").join("individual")
    }

    pub(super) fn analysis_file(&self, full_id: &str) -> PathBuf {
        self.analysis_dir().join(format!("{}.json", hex::encode(full_id)))
    }

    pub(super) fn pairwise_dir(&self) -> PathBuf {
        self.base.join("analysis").join("pairwise")
    }

    pub(super) fn pairwise_file(&self, key: &PairwiseKey) -> PathBuf {
        self.pairwise_dir().join(format!("{}.json", hex::encode(key.to_string())))
    }
}

/// Emails become directory names, so they must not contain separators.
fn path_safe_email(email: &str) -> anyhow::Result<String> {
    let email = email.trim().to_lowercase();
    if email.is_empty() || email.starts_with('.') || email.contains(['/', '\\']) {
        bail!("email '{email}' cannot be stored");
    }

    Ok(email)
}

pub(super) fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
    };

    let value = serde_json::from_slice(&data)
        .with_context(|| format!("corrupt record at {}", path.display()))?;
    Ok(Some(value))
}

/// Write through a temp file in the same dir so readers never see half a record.
pub(super) fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &data)
}

pub(super) fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let Some(dir) = path.parent() else {
        bail!("no parent dir for {}", path.display());
    };
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(data)?;
    file.as_file().sync_all()?;
    file.persist(path).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

pub(super) fn append_line<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(&line)?;
    file.sync_data()?;
    Ok(())
}

/// Every parseable line. Damaged lines are skipped.
pub(super) fn read_lines<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
    };

    let mut values = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str(line) {
            Ok(value) => values.push(value),
            Err(err) => {
                tracing::warn!(error = %err, path = %path.display(), line = index + 1, "Skipping damaged record");
            }
        }
    }

    Ok(values)
}

/// Names of the subdirectories of `dir`, empty if it does not exist.
pub(super) fn list_dirs(dir: &Path) -> anyhow::Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("failed to list {}", dir.display())),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }

    names.sort();
    Ok(names)
}

pub(super) fn remove_dir_if_exists(dir: &Path) -> anyhow::Result<bool> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", dir.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_reject_unsafe_components() {
        let layout = Layout::new(Path::new("/db"));
        assert!(layout.course_dir("../etc").is_err());
        assert!(layout.user_submissions_dir("course101", "hw0", "a/b@test.com").is_err());

        let dir = layout
            .user_submissions_dir("Course101", "HW0", "Alice@Test.com")
            .expect("dir");
        assert_eq!(dir, PathBuf::from("/db/courses/course101/submissions/hw0/alice@test.com"));
    }

    #[test]
    fn damaged_lines_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("log.jsonl");
        append_line(&path, &serde_json::json!({"a": 1})).expect("append");
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut file| file.write_all(b"{not json\n"))
            .expect("corrupt");
        append_line(&path, &serde_json::json!({"a": 2})).expect("append");

        let values: Vec<serde_json::Value> = read_lines(&path).expect("read");
        assert_eq!(values.len(), 2);
    }
}
