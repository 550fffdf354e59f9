//! Running a grader against a prepared submission.
//!
//! Both runners share one contract: the input dir is read-only to the grader, the
//! output dir receives `result.json` plus any extra files, and a timeout or a
//! cancellation is reported through flags rather than as an error.

mod docker;
mod image;
mod local;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::models::assignment::Assignment;

pub(crate) use docker::{connect, DockerRunner};
pub(crate) use image::ImageBuilder;
pub(crate) use local::LocalRunner;

pub(crate) const INPUT_DIRNAME: &str = "input";
pub(crate) const OUTPUT_DIRNAME: &str = "output";
pub(crate) const WORK_DIRNAME: &str = "work";

/// A temp tree with the standard grading dirs. Removed on drop unless kept.
#[derive(Debug)]
pub(crate) struct GradingDirs {
    root: tempfile::TempDir,
    pub(crate) input: PathBuf,
    pub(crate) output: PathBuf,
    pub(crate) work: PathBuf,
}

impl GradingDirs {
    pub(crate) fn create(parent: &Path, prefix: &str) -> anyhow::Result<Self> {
        std::fs::create_dir_all(parent)?;
        let root = tempfile::Builder::new().prefix(prefix).tempdir_in(parent)?;
        let input = root.path().join(INPUT_DIRNAME);
        let output = root.path().join(OUTPUT_DIRNAME);
        let work = root.path().join(WORK_DIRNAME);

        for dir in [&input, &output, &work] {
            std::fs::create_dir_all(dir)?;
        }

        Ok(Self { root, input, output, work })
    }

    pub(crate) fn base(&self) -> &Path {
        self.root.path()
    }

    /// Leave the tree on disk for debugging.
    pub(crate) fn keep(self) -> PathBuf {
        self.root.into_path()
    }
}

pub(crate) struct RunRequest<'a> {
    pub(crate) assignment: &'a Assignment,
    pub(crate) image_name: &'a str,
    pub(crate) dirs: &'a GradingDirs,
    pub(crate) full_id: &'a str,
    pub(crate) max_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RunOutput {
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) timed_out: bool,
    pub(crate) canceled: bool,
}

#[async_trait]
pub(crate) trait Runner: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, cancel: &CancellationToken, request: &RunRequest<'_>) -> anyhow::Result<RunOutput>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stream {
    Stdout,
    Stderr,
}

/// Captured stdout/stderr with one shared size cap.
#[derive(Debug)]
pub(crate) struct OutputBuffer {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub(crate) fn new(limit_kb: u64) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            limit: usize::try_from(limit_kb.saturating_mul(1024)).unwrap_or(usize::MAX),
            truncated: false,
        }
    }

    pub(crate) fn push(&mut self, stream: Stream, data: &[u8]) {
        let used = self.stdout.len() + self.stderr.len();
        let room = self.limit.saturating_sub(used);
        if data.len() > room {
            self.truncated = true;
        }

        let accepted = &data[..data.len().min(room)];
        match stream {
            Stream::Stdout => self.stdout.extend_from_slice(accepted),
            Stream::Stderr => self.stderr.extend_from_slice(accepted),
        }
    }

    pub(crate) fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub(crate) fn finish(self) -> (String, String) {
        let mut stdout = String::from_utf8_lossy(&self.stdout).to_string();
        let mut stderr = String::from_utf8_lossy(&self.stderr).to_string();

        if self.truncated {
            let note = format!(
                "\n\nCombined output (stdout + stderr) exceeds maximum size ({} KB), output has been truncated.",
                self.limit / 1024
            );
            if !stdout.is_empty() {
                stdout.push_str(&note);
            }
            if !stderr.is_empty() {
                stderr.push_str(&note);
            }
        }

        (stdout, stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_is_capped_across_both_streams() {
        let mut buffer = OutputBuffer::new(1);
        buffer.push(Stream::Stdout, &[b'a'; 1000]);
        buffer.push(Stream::Stderr, &[b'b'; 100]);
        assert!(buffer.is_truncated());

        let (stdout, stderr) = buffer.finish();
        assert!(stdout.starts_with(&"a".repeat(1000)));
        assert!(stderr.starts_with(&"b".repeat(24)));
        assert!(stderr.contains("exceeds maximum size (1 KB)"));
    }

    #[test]
    fn small_output_is_untouched() {
        let mut buffer = OutputBuffer::new(4);
        buffer.push(Stream::Stdout, b"hello");
        let (stdout, stderr) = buffer.finish();
        assert_eq!(stdout, "hello");
        assert_eq!(stderr, "");
    }

    #[test]
    fn grading_dirs_are_removed_on_drop() {
        let parent = tempfile::tempdir().expect("tempdir");
        let dirs = GradingDirs::create(parent.path(), "grade-").expect("dirs");
        let base = dirs.base().to_path_buf();
        assert!(dirs.input.is_dir());
        assert!(dirs.output.is_dir());
        drop(dirs);
        assert!(!base.exists());
    }
}
