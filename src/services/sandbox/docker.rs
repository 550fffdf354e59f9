use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{OutputBuffer, RunOutput, RunRequest, Runner, Stream};

pub(crate) const CONTAINER_INPUT_DIR: &str = "/autograder/input";
pub(crate) const CONTAINER_OUTPUT_DIR: &str = "/autograder/output";

/// Seconds a container gets to exit after a stop before it is killed.
const STOP_GRACE_SECS: i64 = 2;

pub(crate) fn connect() -> anyhow::Result<Docker> {
    Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")
}

pub(crate) struct DockerRunner {
    docker: Docker,
    output_max_kb: u64,
}

impl DockerRunner {
    pub(crate) fn new(docker: Docker, output_max_kb: u64) -> Self {
        Self { docker, output_max_kb }
    }

    async fn collect(&self, container_id: &str, buffer: &mut OutputBuffer) {
        let options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: true,
            ..Default::default()
        });

        let mut logs = self.docker.logs(container_id, options);
        while let Some(output) = logs.next().await {
            match output {
                Ok(LogOutput::StdOut { message }) => buffer.push(Stream::Stdout, &message),
                Ok(LogOutput::StdErr { message }) => buffer.push(Stream::Stderr, &message),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, container_id, "Container log stream failed");
                    break;
                }
            }
        }

        let mut wait = self.docker.wait_container(
            container_id,
            Some(WaitContainerOptions { condition: "not-running" }),
        );
        if let Some(Err(err)) = wait.next().await {
            // A non-zero exit also shows up here. The grader's result file decides.
            tracing::debug!(error = %err, container_id, "Container exited abnormally");
        }
    }

    async fn stop(&self, container_id: &str, graceful: bool) {
        if graceful {
            let options = Some(StopContainerOptions { t: STOP_GRACE_SECS });
            if let Err(err) = self.docker.stop_container(container_id, options).await {
                tracing::debug!(error = %err, container_id, "Failed to stop container");
            }
        }

        let options = Some(KillContainerOptions { signal: "KILL" });
        if let Err(err) = self.docker.kill_container(container_id, options).await {
            tracing::debug!(error = %err, container_id, "Failed to kill container");
        }
    }

    async fn remove(&self, container_id: &str) {
        let options = Some(RemoveContainerOptions { force: true, ..Default::default() });
        if let Err(err) = self.docker.remove_container(container_id, options).await {
            tracing::warn!(error = %err, container_id, "Failed to remove container");
        }
    }
}

#[async_trait]
impl Runner for DockerRunner {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn run(&self, cancel: &CancellationToken, request: &RunRequest<'_>) -> anyhow::Result<RunOutput> {
        if cancel.is_cancelled() {
            return Ok(RunOutput { canceled: true, ..RunOutput::default() });
        }

        let name = container_name(request.full_id);
        let input = absolute(&request.dirs.input)?;
        let output = absolute(&request.dirs.output)?;

        let config = Config {
            image: Some(request.image_name.to_string()),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                binds: Some(vec![
                    format!("{input}:{CONTAINER_INPUT_DIR}:ro"),
                    format!("{output}:{CONTAINER_OUTPUT_DIR}"),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions { name: name.as_str(), platform: None };
        let container = self
            .docker
            .create_container(Some(options), config)
            .await
            .with_context(|| format!("Failed to create container '{name}'"))?;
        let container_id = container.id;
        tracing::debug!(container = %name, image = request.image_name, "Created grading container");

        if let Err(err) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove(&container_id).await;
            return Err(err).with_context(|| format!("Failed to start container '{name}'"));
        }

        let mut buffer = OutputBuffer::new(self.output_max_kb);
        let mut timed_out = false;
        let mut canceled = false;

        {
            let finished = self.collect(&container_id, &mut buffer);
            tokio::pin!(finished);

            let deadline = async {
                if request.max_secs > 0 {
                    tokio::time::sleep(Duration::from_secs(request.max_secs)).await;
                } else {
                    std::future::pending::<()>().await;
                }
            };

            tokio::select! {
                _ = &mut finished => {}
                _ = deadline => timed_out = true,
                _ = cancel.cancelled() => canceled = true,
            }
        }

        if timed_out || canceled {
            self.stop(&container_id, timed_out).await;
        }
        self.remove(&container_id).await;

        let (stdout, stderr) = buffer.finish();
        tracing::debug!(container = %name, timed_out, canceled, "Done with grading container");

        Ok(RunOutput { stdout, stderr, timed_out, canceled })
    }
}

/// Docker names allow `[a-zA-Z0-9_.-]` and must start with an alphanumeric.
fn container_name(full_id: &str) -> String {
    let mut name: String = full_id
        .chars()
        .filter(|value| value.is_ascii_alphanumeric() || matches!(value, '_' | '.' | '-'))
        .collect();

    if !name.chars().next().is_some_and(|value| value.is_ascii_alphanumeric()) {
        name.insert(0, 'a');
    }

    format!("{name}-{}", uuid::Uuid::new_v4().simple())
}

fn absolute(path: &std::path::Path) -> anyhow::Result<String> {
    let path = std::path::absolute(path)
        .with_context(|| format!("Failed to resolve {}", path.display()))?;
    Ok(path.to_string_lossy().to_string())
}
