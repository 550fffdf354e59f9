use std::path::PathBuf;

use thiserror::Error;

use crate::db::types::LogLevel;

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(super) runtime: RuntimeSettings,
    pub(super) dirs: DirSettings,
    pub(super) database: DatabaseSettings,
    pub(super) docker: DockerSettings,
    pub(super) grading: GradingSettings,
    pub(super) tasks: TaskSettings,
    pub(super) jobs: JobSettings,
    pub(super) server: ServerSettings,
    pub(super) security: SecuritySettings,
    pub(super) email: EmailSettings,
    pub(super) telemetry: TelemetrySettings,
}

#[derive(Debug, Clone)]
pub(crate) struct RuntimeSettings {
    pub(crate) debug: bool,
    pub(crate) testing: bool,
    pub(crate) load_test_data: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct DirSettings {
    pub(crate) base: PathBuf,
    pub(crate) backup: PathBuf,
    pub(crate) work: PathBuf,
    pub(crate) courses_root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DatabaseKind {
    Disk,
    Memory,
}

#[derive(Debug, Clone)]
pub(crate) struct DatabaseSettings {
    pub(crate) kind: DatabaseKind,
    pub(crate) disk_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub(crate) struct DockerSettings {
    pub(crate) disabled: bool,
    pub(crate) output_max_kb: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct GradingSettings {
    pub(crate) runtime_max_secs: u64,
    pub(crate) no_store: bool,
    pub(crate) keep_build: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct TaskSettings {
    pub(crate) disabled: bool,
    pub(crate) max_wait_secs: u64,
    pub(crate) min_period_secs: u64,
    pub(crate) utc_offset_secs: i32,
}

#[derive(Debug, Clone)]
pub(crate) struct JobSettings {
    pub(crate) regrade_pool_size: usize,
    pub(crate) lock_stale_secs: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct ServerSettings {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) max_upload_kb: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct SecuritySettings {
    pub(crate) secret_key: String,
    pub(crate) access_token_expire_minutes: u64,
    pub(crate) algorithm: String,
}

#[derive(Debug, Clone)]
pub(crate) struct EmailSettings {
    pub(crate) from: String,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) user: String,
    pub(crate) pass: String,
}

#[derive(Debug, Clone)]
pub(crate) struct TelemetrySettings {
    pub(crate) log_level: String,
    pub(crate) pretty: bool,
    pub(crate) json: bool,
    pub(crate) backend_level: LogLevel,
    pub(crate) prometheus_enabled: bool,
}

/// Extra sources given on the command line, applied after files and the environment.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConfigSources {
    pub(crate) config_dir: Option<PathBuf>,
    pub(crate) files: Vec<PathBuf>,
    pub(crate) overrides: Vec<String>,
    pub(crate) skip_env: bool,
}

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
    #[error("unknown database type: '{0}'")]
    UnknownBackend(String),
    #[error("database type '{0}' is not available in this build")]
    Unsupported(String),
    #[error("failed to read config file {path}: {message}")]
    File { path: String, message: String },
    #[error("config override must look like 'key=value', found '{0}'")]
    InvalidOverride(String),
}
