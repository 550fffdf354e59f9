use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::core::config::Settings;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub(crate) const GRADING_DURATION: &str = "autograder_grading_duration_seconds";
pub(crate) const GRADING_OUTCOMES: &str = "autograder_grading_total";
pub(crate) const TASK_DURATION: &str = "autograder_task_duration_seconds";
pub(crate) const TASK_RUNS: &str = "autograder_task_runs_total";
pub(crate) const JOB_ITEMS: &str = "autograder_job_items_total";

pub(crate) fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROM_HANDLE.set(handle);
    Ok(())
}

pub(crate) fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}
