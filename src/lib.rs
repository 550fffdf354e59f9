pub(crate) mod api;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod grading;
pub(crate) mod jobs;
pub(crate) mod models;
pub(crate) mod schemas;
pub(crate) mod services;
pub(crate) mod tasks;

#[cfg(test)]
mod test_support;

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use tokio_util::sync::CancellationToken;

use crate::core::config::{ConfigSources, Settings};
use crate::core::{bootstrap, shutdown, state::AppState, telemetry};
use crate::grading::{GradeOptions, GradeOutcome};
use crate::models::user::ROOT_EMAIL;

/// Configuration sources shared by every binary.
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    /// Directory holding `config.json` and `secrets.json`.
    #[arg(long, value_name = "DIR")]
    pub config_dir: Option<PathBuf>,
    /// Extra JSON config files, applied in order.
    #[arg(long = "config-file", value_name = "PATH")]
    pub config_files: Vec<PathBuf>,
    /// `key=value` overrides, applied last.
    #[arg(short = 'c', long = "config", value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,
}

#[derive(Debug, Clone, Args)]
pub struct GradeArgs {
    #[arg(long)]
    pub course: String,
    #[arg(long)]
    pub assignment: String,
    #[arg(long, value_name = "DIR")]
    pub submission: PathBuf,
    #[arg(long, default_value = ROOT_EMAIL)]
    pub user: String,
    #[arg(long, default_value = "")]
    pub message: String,
    /// Write the grading info as JSON here.
    #[arg(long, value_name = "PATH")]
    pub out: Option<PathBuf>,
    #[arg(long)]
    pub allow_late: bool,
    #[arg(long)]
    pub no_store: bool,
}

fn load_settings(args: &ConfigArgs) -> anyhow::Result<Settings> {
    dotenvy::dotenv().ok();

    let sources = ConfigSources {
        config_dir: args.config_dir.clone(),
        files: args.config_files.clone(),
        overrides: args.overrides.clone(),
        skip_env: false,
    };
    let settings = Settings::load_with(&sources)?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;
    Ok(settings)
}

async fn open_state(settings: Settings) -> anyhow::Result<AppState> {
    let state = AppState::open(settings).await.context("Failed to open the database")?;
    bootstrap::startup(&state).await?;
    shutdown::cancel_on_shutdown(state.shutdown().clone());
    Ok(state)
}

/// The HTTP API, plus the task engine unless `tasks.disable` is set.
pub async fn run(args: ConfigArgs) -> anyhow::Result<()> {
    let settings = load_settings(&args)?;
    let state = open_state(settings).await?;

    let background = if state.settings().tasks().disabled {
        tracing::info!("Task engine is disabled");
        tokio::spawn(tasks::lock_cleanup_loop(state.clone()))
    } else {
        tokio::spawn(tasks::run(state.clone()))
    };

    let app = api::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.settings().server_addr()).await?;

    tracing::info!(
        host = %state.settings().server().host,
        port = state.settings().server().port,
        backend = state.backend().name(),
        "Autograder API listening"
    );

    let shutdown_token = state.shutdown().clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
        .await;

    state.shutdown().cancel();
    background.abort();
    state.close().await?;

    result?;

    Ok(())
}

/// The task engine alone.
pub async fn run_worker(args: ConfigArgs) -> anyhow::Result<()> {
    let settings = load_settings(&args)?;
    let state = open_state(settings).await?;

    tasks::run(state.clone()).await;

    state.close().await?;
    Ok(())
}

/// Grade one submission dir and print its report. `Ok(false)` means the submission was
/// rejected or grading did not finish.
pub async fn run_grade(config: ConfigArgs, args: GradeArgs) -> anyhow::Result<bool> {
    let settings = load_settings(&config)?;
    let state = open_state(settings).await?;

    let course_id = args.course.trim().to_lowercase();
    let course = state
        .backend()
        .get_course(&course_id)
        .await?
        .with_context(|| format!("Unknown course '{course_id}'"))?;
    let assignment = course
        .assignment(&args.assignment.trim().to_lowercase())
        .with_context(|| format!("Unknown assignment '{}' in course '{course_id}'", args.assignment))?;

    let mut options = GradeOptions::from_settings(state.settings());
    options.allow_late = args.allow_late;
    options.no_store |= args.no_store;

    let cancel: CancellationToken = state.shutdown().child_token();
    let outcome = grading::grade(&state, &cancel, assignment, &args.submission, &args.user, &args.message, &options)
        .await
        .map_err(|err| err.error)?;

    let success = match &outcome {
        GradeOutcome::Graded(result) => {
            let info = result.info.as_ref().context("Grading finished without a result")?;
            println!("{}", info.report());

            if let Some(out) = &args.out {
                let json = serde_json::to_vec_pretty(info)?;
                tokio::fs::write(out, json)
                    .await
                    .with_context(|| format!("Failed to write grading info to {}", out.display()))?;
            }
            true
        }
        GradeOutcome::Rejected(reason) => {
            println!("Submission was rejected: {reason}");
            false
        }
        GradeOutcome::SoftFailure { message, result } => {
            println!("Grading did not finish: {message}");
            if result.has_text_output() {
                println!("{}", result.combined_output());
            }
            false
        }
    };

    state.close().await?;
    Ok(success)
}
