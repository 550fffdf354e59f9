use std::env;
use std::path::PathBuf;

use super::parsing::{
    get_optional, get_or_default, invalid, merge_env, merge_file, merge_override, parse_bool,
    parse_i32, parse_u16, parse_u64, ConfigMap,
};
use super::secret::load_or_create_secret_key;
use super::types::{
    ConfigError, ConfigSources, DatabaseKind, DatabaseSettings, DirSettings, DockerSettings,
    EmailSettings, GradingSettings, JobSettings, RuntimeSettings, SecuritySettings,
    ServerSettings, Settings, TaskSettings, TelemetrySettings,
};
use crate::db::types::LogLevel;

const CONFIG_DIR_ENV: &str = "AUTOGRADER_CONFIG_DIR";
const CONFIG_FILENAME: &str = "config.json";
const SECRETS_FILENAME: &str = "secrets.json";

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        Self::load_with(&ConfigSources::default())
    }

    /// Files in the config dir, then the environment, then CLI files, then `-c` overrides.
    pub(crate) fn load_with(sources: &ConfigSources) -> Result<Self, ConfigError> {
        let config_dir = sources
            .config_dir
            .clone()
            .or_else(|| env::var(CONFIG_DIR_ENV).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config"));

        let mut map = ConfigMap::new();
        merge_file(&mut map, &config_dir.join(CONFIG_FILENAME), false)?;
        merge_file(&mut map, &config_dir.join(SECRETS_FILENAME), false)?;

        if !sources.skip_env {
            merge_env(&mut map, env::vars());
        }

        for path in &sources.files {
            merge_file(&mut map, path, true)?;
        }

        for raw in &sources.overrides {
            merge_override(&mut map, raw)?;
        }

        Self::from_map(&map)
    }

    pub(crate) fn from_map(map: &ConfigMap) -> Result<Self, ConfigError> {
        let debug = parse_bool("debug", map, false)?;
        let testing = parse_bool("testing", map, false)?;
        let load_test_data = parse_bool("load.test.data", map, false)?;

        let base = PathBuf::from(get_or_default(map, "dirs.base", "autograder-data"));
        let backup = path_or(map, "backup.dir", base.join("backups"));
        let work = path_or(map, "work.dir", env::temp_dir().join("autograder-work"));
        let courses_root = path_or(map, "courses.rootdir", base.join("sources"));

        let db_type = get_or_default(map, "db.type", "disk").to_lowercase();
        let db_kind = match db_type.as_str() {
            "disk" => DatabaseKind::Disk,
            "memory" => DatabaseKind::Memory,
            "sqlite" | "postgres" => return Err(ConfigError::Unsupported(db_type)),
            _ => return Err(ConfigError::UnknownBackend(db_type)),
        };
        let disk_dir = path_or(map, "db.disk.dir", base.join("database"));

        let docker_disabled = parse_bool("docker.disable", map, false)?;
        let output_max_kb = parse_u64("docker.output.maxsize", map, 4 * 1024)?;

        let runtime_max_secs = parse_u64("grading.runtime.max", map, 5 * 60)?;
        let no_store = parse_bool("grader.nostore", map, false)?;
        let keep_build = parse_bool("build.keep", map, false)?;

        let tasks_disabled = parse_bool("tasks.disable", map, false)?;
        let max_wait_secs = parse_u64("tasks.maxwait", map, 2 * 60)?;
        let min_period_secs = parse_u64("tasks.minperiod", map, 10 * 60)?;
        let utc_offset_secs = parse_i32("tasks.utcoffset", map, 0)?;
        if utc_offset_secs.abs() >= 24 * 60 * 60 {
            return Err(invalid("tasks.utcoffset", &utc_offset_secs.to_string()));
        }

        let regrade_pool_size = parse_u64("regrade.poolsize", map, 1)?;
        if regrade_pool_size == 0 {
            return Err(invalid("regrade.poolsize", "0"));
        }
        let lock_stale_secs = parse_u64("lockmanager.staleduration", map, 2 * 60 * 60)?;

        let host = get_or_default(map, "web.host", "0.0.0.0");
        let port = parse_u16("web.port", map, 8080)?;
        let max_upload_kb = parse_u64("web.maxsize", map, 2 * 1024)?;

        let secret_key = match get_optional(map, "web.token.secret") {
            Some(value) => value.to_string(),
            None => load_or_create_secret_key(&base),
        };
        let access_token_expire_minutes = parse_u64("web.token.expire", map, 24 * 60)?;

        let email = EmailSettings {
            from: get_or_default(map, "email.from", ""),
            host: get_or_default(map, "email.host", ""),
            port: parse_u16("email.port", map, 587)?,
            user: get_or_default(map, "email.user", ""),
            pass: get_or_default(map, "email.pass", ""),
        };

        let log_level = get_or_default(map, "log.level", if debug { "debug" } else { "info" });
        let pretty = parse_bool("log.pretty", map, false)?;
        let json = parse_bool("log.json", map, false)?;
        let backend_level_raw = get_or_default(map, "log.backend.level", "info");
        let backend_level = backend_level_raw
            .parse::<LogLevel>()
            .map_err(|_| invalid("log.backend.level", &backend_level_raw))?;
        let prometheus_enabled = parse_bool("metrics.prometheus", map, false)?;

        Ok(Self {
            runtime: RuntimeSettings { debug, testing, load_test_data },
            dirs: DirSettings { base, backup, work, courses_root },
            database: DatabaseSettings { kind: db_kind, disk_dir },
            docker: DockerSettings { disabled: docker_disabled, output_max_kb },
            grading: GradingSettings { runtime_max_secs, no_store, keep_build },
            tasks: TaskSettings {
                disabled: tasks_disabled,
                max_wait_secs,
                min_period_secs,
                utc_offset_secs,
            },
            jobs: JobSettings { regrade_pool_size: regrade_pool_size as usize, lock_stale_secs },
            server: ServerSettings { host, port, max_upload_kb },
            security: SecuritySettings {
                secret_key,
                access_token_expire_minutes,
                algorithm: String::from("HS256"),
            },
            email,
            telemetry: TelemetrySettings {
                log_level,
                pretty,
                json,
                backend_level,
                prometheus_enabled,
            },
        })
    }
}

fn path_or(map: &ConfigMap, key: &str, default: PathBuf) -> PathBuf {
    get_optional(map, key).map(PathBuf::from).unwrap_or(default)
}

impl EmailSettings {
    pub(crate) fn is_configured(&self) -> bool {
        !self.host.is_empty() && !self.from.is_empty()
    }
}
