use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use super::{GradingDirs, OutputBuffer, RunOutput, RunRequest, Runner, Stream};
use crate::models::assignment::Assignment;
use crate::models::grading::RESULT_FILENAME;
use crate::services::archive::{apply_file_ops, copy_path, safe_join};

const PYTHON_IMAGE_BASENAME: &str = "edulinq/grader.python";
const PYTHON_GRADER_FILENAME: &str = "grader.py";
const PYTHON_INVOCATION: [&str; 8] = [
    "python3",
    "-m",
    "autograder.cli.grading.grade-dir",
    "--grader",
    "<grader>",
    "--dir",
    "<basedir>",
    "--outpath",
];

/// How long a killed process gets to close its pipes.
const KILL_WAIT: Duration = Duration::from_secs(10);

/// How long the grader's process group gets between SIGTERM and SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Runs the assignment's invocation directly on the host, inside the grading temp tree.
pub(crate) struct LocalRunner {
    output_max_kb: u64,
}

impl LocalRunner {
    pub(crate) fn new(output_max_kb: u64) -> Self {
        Self { output_max_kb }
    }
}

#[async_trait]
impl Runner for LocalRunner {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn run(&self, cancel: &CancellationToken, request: &RunRequest<'_>) -> anyhow::Result<RunOutput> {
        if cancel.is_cancelled() {
            return Ok(RunOutput { canceled: true, ..RunOutput::default() });
        }

        let command = invocation(request.assignment, request.dirs)?;

        let assignment = request.assignment.clone();
        let base = request.dirs.base().to_path_buf();
        let work = request.dirs.work.clone();
        tokio::task::spawn_blocking(move || stage_static_files(&assignment, &base, &work))
            .await
            .context("static file staging panicked")??;

        let mut grader = Command::new(&command[0]);
        grader
            .args(&command[1..])
            .current_dir(&request.dirs.work)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own group, so a stop reaches everything the grader forks.
        #[cfg(unix)]
        grader.process_group(0);
        let mut child = grader
            .spawn()
            .with_context(|| format!("Failed to start grader '{}'", command[0]))?;

        let stdout = tokio::spawn(read_all(child.stdout.take()));
        let stderr = tokio::spawn(read_all(child.stderr.take()));

        let deadline = async {
            if request.max_secs > 0 {
                tokio::time::sleep(Duration::from_secs(request.max_secs)).await;
            } else {
                std::future::pending::<()>().await;
            }
        };

        let mut timed_out = false;
        let mut canceled = false;
        tokio::select! {
            status = child.wait() => {
                let status = status.context("Failed to wait on grader")?;
                tracing::debug!(%status, assignment = %request.assignment.full_id(), "Local grader exited");
            }
            _ = deadline => timed_out = true,
            _ = cancel.cancelled() => canceled = true,
        }

        if timed_out || canceled {
            stop(&mut child).await;
        }

        let mut buffer = OutputBuffer::new(self.output_max_kb);
        for (stream, handle) in [(Stream::Stdout, stdout), (Stream::Stderr, stderr)] {
            match tokio::time::timeout(KILL_WAIT, handle).await {
                Ok(Ok(data)) => buffer.push(stream, &data),
                Ok(Err(err)) => tracing::warn!(error = %err, "Grader output reader failed"),
                Err(_) => tracing::warn!("Timed out reading grader output"),
            }
        }

        let (stdout, stderr) = buffer.finish();
        Ok(RunOutput { stdout, stderr, timed_out, canceled })
    }
}

/// SIGTERM the grader's process group, then SIGKILL whatever survives the grace period.
#[cfg(unix)]
async fn stop(child: &mut Child) {
    let Some(pgid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };

    signal_group(pgid, libc::SIGTERM);
    if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_err() {
        tracing::debug!(pgid, "Grader ignored SIGTERM");
    }
    // Forked helpers may outlive the leader and keep the output pipes open.
    signal_group(pgid, libc::SIGKILL);
    let _ = tokio::time::timeout(KILL_WAIT, child.wait()).await;
}

#[cfg(not(unix))]
async fn stop(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        tracing::debug!(error = %err, "Failed to kill grader process");
    }
    let _ = tokio::time::timeout(KILL_WAIT, child.wait()).await;
}

#[cfg(unix)]
fn signal_group(pgid: libc::pid_t, signal: libc::c_int) {
    // SAFETY: kill(2) has no memory effects; a negative pid addresses the group.
    if unsafe { libc::kill(-pgid, signal) } == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::debug!(pgid, signal, error = %err, "Failed to signal grader process group");
        }
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    let mut data = Vec::new();
    if let Some(mut reader) = reader {
        if let Err(err) = reader.read_to_end(&mut data).await {
            tracing::debug!(error = %err, "Grader output closed early");
        }
    }
    data
}

/// Copy static files into the work dir, running the static file ops around the copy.
/// File ops see paths relative to the grading temp root.
fn stage_static_files(assignment: &Assignment, base: &Path, work: &Path) -> anyhow::Result<()> {
    let image = &assignment.image;
    apply_file_ops(base, &image.pre_static_file_ops)?;

    for static_file in &image.static_files {
        let source = safe_join(&assignment.source_dir, static_file)?;
        let name = source
            .file_name()
            .map(PathBuf::from)
            .with_context(|| format!("static file '{static_file}' has no name"))?;
        copy_path(&source, &work.join(name))
            .with_context(|| format!("Failed to copy static file '{static_file}'"))?;
    }

    apply_file_ops(base, &image.post_static_file_ops)?;
    apply_file_ops(base, &image.post_submission_file_ops)
}

/// The assignment's invocation with every placeholder filled in.
fn invocation(assignment: &Assignment, dirs: &GradingDirs) -> anyhow::Result<Vec<String>> {
    let image = &assignment.image;
    let raw: Vec<String> = if !image.invocation.is_empty() {
        image.invocation.clone()
    } else if image.image.contains(PYTHON_IMAGE_BASENAME) {
        PYTHON_INVOCATION
            .iter()
            .map(|part| part.to_string())
            .chain(std::iter::once(String::from("<outpath>")))
            .collect()
    } else {
        bail!("Cannot get a local grader invocation for assignment '{}'", assignment.full_id());
    };

    let path = |path: &Path| path.to_string_lossy().to_string();
    Ok(raw
        .into_iter()
        .map(|part| match part.as_str() {
            "<grader>" => path(&dirs.work.join(PYTHON_GRADER_FILENAME)),
            "<basedir>" => path(dirs.base()),
            "<inputdir>" => path(&dirs.input),
            "<outputdir>" => path(&dirs.output),
            "<workdir>" => path(&dirs.work),
            "<outpath>" => path(&dirs.output.join(RESULT_FILENAME)),
            _ => part,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::image::ImageInfo;

    fn assignment(invocation: &[&str]) -> Assignment {
        let image = ImageInfo {
            invocation: invocation.iter().map(|part| part.to_string()).collect(),
            ..ImageInfo::default()
        };
        Assignment::new("course101", "hw0", image)
    }

    fn request<'a>(assignment: &'a Assignment, dirs: &'a GradingDirs, max_secs: u64) -> RunRequest<'a> {
        RunRequest { assignment, image_name: "unused", dirs, full_id: "course101::hw0::a@b::1", max_secs }
    }

    #[test]
    fn placeholders_are_substituted() {
        let parent = tempfile::tempdir().expect("tempdir");
        let dirs = GradingDirs::create(parent.path(), "grade-").expect("dirs");
        let assignment = assignment(&["run", "<inputdir>", "<outpath>", "--flag"]);

        let command = invocation(&assignment, &dirs).expect("invocation");
        assert_eq!(command[0], "run");
        assert_eq!(command[1], dirs.input.to_string_lossy());
        assert_eq!(command[2], dirs.output.join("result.json").to_string_lossy());
        assert_eq!(command[3], "--flag");
    }

    #[test]
    fn python_images_get_a_default_invocation() {
        let parent = tempfile::tempdir().expect("tempdir");
        let dirs = GradingDirs::create(parent.path(), "grade-").expect("dirs");
        let mut assignment = assignment(&[]);
        assignment.image.image = String::from("edulinq/grader.python:latest");

        let command = invocation(&assignment, &dirs).expect("invocation");
        assert_eq!(command[0], "python3");
        let outpath = dirs.output.join("result.json").to_string_lossy().to_string();
        assert_eq!(command.last(), Some(&outpath));

        assignment.image.image = String::from("custom/image");
        assert!(invocation(&assignment, &dirs).is_err());
    }

    #[tokio::test]
    async fn output_is_captured() {
        let parent = tempfile::tempdir().expect("tempdir");
        let dirs = GradingDirs::create(parent.path(), "grade-").expect("dirs");
        let assignment = assignment(&["sh", "-c", "echo out; echo err >&2"]);

        let output = LocalRunner::new(16)
            .run(&CancellationToken::new(), &request(&assignment, &dirs, 10))
            .await
            .expect("run");
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert!(!output.timed_out && !output.canceled);
    }

    #[tokio::test]
    async fn slow_graders_time_out() {
        let parent = tempfile::tempdir().expect("tempdir");
        let dirs = GradingDirs::create(parent.path(), "grade-").expect("dirs");
        let assignment = assignment(&["sleep", "30"]);

        let output = LocalRunner::new(16)
            .run(&CancellationToken::new(), &request(&assignment, &dirs, 1))
            .await
            .expect("run");
        assert!(output.timed_out);
        assert!(!output.canceled);
    }

    #[tokio::test]
    async fn cancellation_stops_the_grader() {
        let parent = tempfile::tempdir().expect("tempdir");
        let dirs = GradingDirs::create(parent.path(), "grade-").expect("dirs");
        let assignment = assignment(&["sleep", "30"]);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let output = LocalRunner::new(16)
            .run(&cancel, &request(&assignment, &dirs, 0))
            .await
            .expect("run");
        assert!(output.canceled);
        assert!(!output.timed_out);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeouts_stop_forked_helpers() {
        let parent = tempfile::tempdir().expect("tempdir");
        let dirs = GradingDirs::create(parent.path(), "grade-").expect("dirs");
        let marker = parent.path().join("marker");
        let script = format!("(sleep 3; touch '{}') & wait", marker.display());
        let assignment = assignment(&["sh", "-c", &script]);

        let started = std::time::Instant::now();
        let output = LocalRunner::new(16)
            .run(&CancellationToken::new(), &request(&assignment, &dirs, 1))
            .await
            .expect("run");
        assert!(output.timed_out);
        assert!(!output.canceled);
        assert!(started.elapsed() < Duration::from_millis(2500), "took {:?}", started.elapsed());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists());
    }
}
