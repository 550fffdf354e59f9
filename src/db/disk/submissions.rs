use std::fs;
use std::path::Path;

use anyhow::Context;

use super::layout::{list_dirs, read_json, write_atomic, write_json};
use crate::db::compare_short_ids;
use crate::models::grading::{GradingInfo, GradingResult};
use crate::services::archive::{gzip_dir, write_gzip_files};

const RESULT_FILENAME: &str = "submission-result.json";
const INPUT_DIRNAME: &str = "input";
const OUTPUT_DIRNAME: &str = "output";
const STDOUT_FILENAME: &str = "stdout";
const STDERR_FILENAME: &str = "stderr";

/// Short ids with a stored result, oldest first.
pub(super) fn short_ids(user_dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut ids: Vec<String> = list_dirs(user_dir)?
        .into_iter()
        .filter(|id| user_dir.join(id).join(RESULT_FILENAME).exists())
        .collect();
    ids.sort_by(|left, right| compare_short_ids(left, right));
    Ok(ids)
}

pub(super) fn write_submission(submission_dir: &Path, result: &GradingResult) -> anyhow::Result<()> {
    if submission_dir.exists() {
        fs::remove_dir_all(submission_dir)
            .with_context(|| format!("failed to replace {}", submission_dir.display()))?;
    }

    write_gzip_files(&result.input_files_gzip, &submission_dir.join(INPUT_DIRNAME))?;
    write_gzip_files(&result.output_files_gzip, &submission_dir.join(OUTPUT_DIRNAME))?;
    write_atomic(&submission_dir.join(STDOUT_FILENAME), result.stdout.as_bytes())?;
    write_atomic(&submission_dir.join(STDERR_FILENAME), result.stderr.as_bytes())?;

    // The result file goes last, it marks the submission as complete.
    write_json(&submission_dir.join(RESULT_FILENAME), &result.info)?;
    Ok(())
}

pub(super) fn read_info(submission_dir: &Path) -> anyhow::Result<Option<GradingInfo>> {
    read_json(&submission_dir.join(RESULT_FILENAME))
}

pub(super) fn read_submission(submission_dir: &Path) -> anyhow::Result<Option<GradingResult>> {
    let Some(info) = read_info(submission_dir)? else {
        return Ok(None);
    };

    Ok(Some(GradingResult {
        info: Some(info),
        input_files_gzip: gzip_dir(&submission_dir.join(INPUT_DIRNAME))?,
        output_files_gzip: gzip_dir(&submission_dir.join(OUTPUT_DIRNAME))?,
        stdout: read_text(&submission_dir.join(STDOUT_FILENAME))?,
        stderr: read_text(&submission_dir.join(STDERR_FILENAME))?,
    }))
}

fn read_text(path: &Path) -> anyhow::Result<String> {
    match fs::read(path) {
        Ok(data) => Ok(String::from_utf8_lossy(&data).to_string()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}
