use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use bollard::image::BuildImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use super::WORK_DIRNAME;
use crate::core::lockmanager::LockManager;
use crate::models::assignment::Assignment;
use crate::services::archive::{apply_file_ops, copy_path, safe_join};

const CONTAINER_BASE_DIR: &str = "/autograder";
const CONFIG_FILENAME: &str = "config.json";
const POST_SUBMISSION_OPS_FILENAME: &str = "post-submission-files-ops.sh";

/// What the last build of an image looked like.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct BuildRecord {
    #[serde(rename = "image-info-hash", default)]
    hash: String,
    #[serde(rename = "image-build-success", default)]
    success: bool,
}

/// Builds assignment images, skipping builds whose inputs have not changed.
pub(crate) struct ImageBuilder {
    docker: Option<Docker>,
    cache_dir: PathBuf,
    keep_build_dirs: bool,
    locks: Arc<LockManager>,
}

impl ImageBuilder {
    /// `docker: None` turns every build into a no-op.
    pub(crate) fn new(
        docker: Option<Docker>,
        cache_dir: &Path,
        keep_build_dirs: bool,
        locks: Arc<LockManager>,
    ) -> Self {
        Self { docker, cache_dir: cache_dir.to_path_buf(), keep_build_dirs, locks }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.docker.is_some()
    }

    /// Build unless the image info and static files match the last successful build.
    pub(crate) async fn build_quick(&self, assignment: &Assignment) -> anyhow::Result<bool> {
        self.build(assignment, false).await
    }

    /// Returns whether a build actually ran.
    pub(crate) async fn build(&self, assignment: &Assignment, force: bool) -> anyhow::Result<bool> {
        let Some(docker) = &self.docker else {
            return Ok(false);
        };

        let _guard = self.locks.lock(&format!("image::{}", assignment.full_id())).await;

        let record_path = self.record_path(assignment);
        let source = assignment.clone();
        let (hash, previous) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            Ok((build_hash(&source)?, read_record(&record_path)?))
        })
        .await
        .context("image hash task panicked")??;

        if !force && previous.success && previous.hash == hash {
            tracing::debug!(assignment = %assignment.full_id(), "No image changes, skipping build");
            return Ok(false);
        }

        let result = self.build_image(docker, assignment, force).await;
        let record = BuildRecord { hash, success: result.is_ok() };
        write_record(&self.record_path(assignment), &record)?;

        result.map(|_| true)
    }

    fn record_path(&self, assignment: &Assignment) -> PathBuf {
        self.cache_dir.join(format!("{}.json", hex::encode(assignment.full_id())))
    }

    async fn build_image(&self, docker: &Docker, assignment: &Assignment, no_cache: bool) -> anyhow::Result<()> {
        let image_name = assignment.image_name();
        let dir = tempfile::Builder::new()
            .prefix(&format!("autograder-docker-build-{image_name}-"))
            .tempdir()?;

        let source = assignment.clone();
        let context_dir = dir.path().to_path_buf();
        let context = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
            write_context(&source, &context_dir)?;
            tar_dir(&context_dir)
        })
        .await
        .context("build context task panicked")??;

        if self.keep_build_dirs {
            let kept = dir.into_path();
            tracing::debug!(path = %kept.display(), "Leaving behind image build dir");
        }

        let options = BuildImageOptions {
            dockerfile: "Dockerfile",
            t: image_name.as_str(),
            rm: true,
            nocache: no_cache,
            ..Default::default()
        };

        tracing::info!(image = %image_name, "Building assignment image");
        let mut output = String::new();
        let mut stream = docker.build_image(options, None, Some(context.into()));
        while let Some(item) = stream.next().await {
            let info = item.with_context(|| format!("Failed to build image '{image_name}'"))?;
            if let Some(error) = info.error {
                tracing::warn!(image = %image_name, message = %error, "Image build had an error entry");
                bail!("Failed to build image '{image_name}': {error}");
            }
            if let Some(line) = info.stream {
                output.push_str(&line);
            }
        }

        tracing::trace!(image = %image_name, output = %output, "Image build output");
        Ok(())
    }
}

fn read_record(path: &Path) -> anyhow::Result<BuildRecord> {
    match fs::read(path) {
        Ok(data) => Ok(serde_json::from_slice(&data).unwrap_or_default()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BuildRecord::default()),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn write_record(path: &Path, record: &BuildRecord) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_vec_pretty(record)?)
        .with_context(|| format!("failed to write {}", path.display()))
}

/// Hash of the image info plus the content of every static file.
fn build_hash(assignment: &Assignment) -> anyhow::Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(assignment.image.hash());

    for static_file in &assignment.image.static_files {
        let path = safe_join(&assignment.source_dir, static_file)?;
        hasher.update(static_file.as_bytes());
        for entry in WalkDir::new(&path).sort_by_file_name() {
            let entry = entry.with_context(|| format!("missing static file '{static_file}'"))?;
            if entry.file_type().is_file() {
                hasher.update(entry.path().to_string_lossy().as_bytes());
                hasher.update(fs::read(entry.path())?);
            }
        }
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Dockerfile, grader config, post-submission script, and the staged static files.
fn write_context(assignment: &Assignment, dir: &Path) -> anyhow::Result<()> {
    let image = &assignment.image;
    let work = dir.join(WORK_DIRNAME);
    fs::create_dir_all(&work)?;

    apply_file_ops(dir, &image.pre_static_file_ops)?;
    for static_file in &image.static_files {
        let source = safe_join(&assignment.source_dir, static_file)?;
        let Some(name) = source.file_name() else {
            bail!("static file '{static_file}' has no name");
        };
        copy_path(&source, &work.join(name))?;
    }
    apply_file_ops(dir, &image.post_static_file_ops)?;

    let config = image.grading_config(&assignment.image_name());
    fs::write(dir.join(CONFIG_FILENAME), serde_json::to_vec_pretty(&config)?)?;
    fs::write(dir.join(POST_SUBMISSION_OPS_FILENAME), post_submission_script(assignment))?;
    fs::write(dir.join("Dockerfile"), dockerfile(assignment, &work)?)?;
    Ok(())
}

fn post_submission_script(assignment: &Assignment) -> String {
    let mut lines = vec![
        String::from("#!/bin/bash"),
        format!("# Post-submission operations for '{}'.", assignment.image_name()),
    ];

    for op in &assignment.image.post_submission_file_ops {
        let args: Vec<String> = op.args().iter().map(|arg| shell_quote(arg)).collect();
        let command = match op.0.first().map(String::as_str) {
            Some("cp") => format!("cp -r {}", args.join(" ")),
            Some("mv") => format!("mv {}", args.join(" ")),
            Some("mkdir") => format!("mkdir -p {}", args.join(" ")),
            Some("rm") => format!("rm -rf {}", args.join(" ")),
            _ => continue,
        };
        lines.push(command);
    }

    lines.join("\n") + "\n"
}

fn dockerfile(assignment: &Assignment, work: &Path) -> anyhow::Result<String> {
    let image = &assignment.image;
    let mut lines = vec![format!("FROM {}", image.image), String::new()];

    lines.push(String::from("# Core directories"));
    for dir in ["", "/input", "/output", "/work", "/scripts"] {
        lines.push(format!("RUN mkdir -p '{CONTAINER_BASE_DIR}{dir}'"));
    }
    lines.push(String::new());
    lines.push(format!("WORKDIR {CONTAINER_BASE_DIR}"));
    lines.push(String::new());
    lines.push(format!("COPY {CONFIG_FILENAME} {CONTAINER_BASE_DIR}/{CONFIG_FILENAME}"));
    lines.push(format!(
        "COPY {POST_SUBMISSION_OPS_FILENAME} {CONTAINER_BASE_DIR}/scripts/{POST_SUBMISSION_OPS_FILENAME}"
    ));
    lines.push(String::new());

    lines.push(String::from("# Pre-static commands"));
    lines.extend(image.pre_static_docker_commands.iter().cloned());
    lines.push(String::new());

    lines.push(String::from("# Static files"));
    let mut names: Vec<String> = fs::read_dir(work)?
        .map(|entry| entry.map(|entry| entry.file_name().to_string_lossy().to_string()))
        .collect::<Result<_, _>>()?;
    names.sort();
    for name in names {
        lines.push(format!(
            "COPY [\"{WORK_DIRNAME}/{name}\", \"{CONTAINER_BASE_DIR}/{WORK_DIRNAME}/{name}\"]"
        ));
    }
    lines.push(String::new());

    lines.push(String::from("# Post-static commands"));
    lines.extend(image.post_static_docker_commands.iter().cloned());
    lines.push(String::new());

    Ok(lines.join("\n"))
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn tar_dir(dir: &Path) -> anyhow::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", dir)?;
    Ok(builder.into_inner()?)
}
