use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::core::state::AppState;
use crate::core::time::Timestamp;
use crate::models::course::Course;
use crate::services::archive::zip_dir;

/// `<dir>/<course>-<stamp>.zip`, numbered when that name is taken.
fn backup_path(dir: &Path, course_id: &str, now: Timestamp) -> PathBuf {
    let stem = format!("{course_id}-{}", now.to_compact_string());
    let mut path = dir.join(format!("{stem}.zip"));
    let mut suffix = 1;
    while path.exists() {
        path = dir.join(format!("{stem}-{suffix:03}.zip"));
        suffix += 1;
    }
    path
}

/// Zip the course's stored state into the backup dir. Returns the archive path.
pub(super) async fn run(state: &AppState, course: &Course, now: Timestamp) -> anyhow::Result<PathBuf> {
    let backup_dir = state.settings().dirs().backup.clone();
    let work_root = state.settings().dirs().work.clone();

    let staging = tokio::task::spawn_blocking(move || -> anyhow::Result<tempfile::TempDir> {
        std::fs::create_dir_all(&work_root)?;
        Ok(tempfile::Builder::new().prefix("autograder-backup-").tempdir_in(&work_root)?)
    })
    .await
    .context("backup staging task panicked")??;

    state
        .backend()
        .dump_course(&course.id, staging.path())
        .await
        .with_context(|| format!("Failed to dump course '{}'", course.id))?;

    let course_id = course.id.clone();
    let path = tokio::task::spawn_blocking(move || -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&backup_dir)
            .with_context(|| format!("Failed to create backup dir {}", backup_dir.display()))?;
        let path = backup_path(&backup_dir, &course_id, now);
        zip_dir(staging.path(), &path)?;
        Ok(path)
    })
    .await
    .context("backup zip task panicked")??;

    tracing::info!(course_id = %course.id, path = %path.display(), "Backed up course");
    Ok(path)
}
