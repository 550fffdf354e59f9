mod parsing;
mod secret;
mod settings;
mod types;

use time::UtcOffset;

pub(crate) use parsing::ConfigMap;
pub(crate) use types::{
    ConfigError, ConfigSources, DatabaseKind, DatabaseSettings, DirSettings, DockerSettings,
    EmailSettings, GradingSettings, JobSettings, RuntimeSettings, SecuritySettings,
    ServerSettings, Settings, TaskSettings, TelemetrySettings,
};

use crate::models::tasks::TaskLimits;

impl Settings {
    pub(crate) fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    pub(crate) fn dirs(&self) -> &DirSettings {
        &self.dirs
    }

    pub(crate) fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub(crate) fn docker(&self) -> &DockerSettings {
        &self.docker
    }

    pub(crate) fn grading(&self) -> &GradingSettings {
        &self.grading
    }

    pub(crate) fn tasks(&self) -> &TaskSettings {
        &self.tasks
    }

    pub(crate) fn jobs(&self) -> &JobSettings {
        &self.jobs
    }

    pub(crate) fn server(&self) -> &ServerSettings {
        &self.server
    }

    pub(crate) fn security(&self) -> &SecuritySettings {
        &self.security
    }

    pub(crate) fn email(&self) -> &EmailSettings {
        &self.email
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn utc_offset(&self) -> UtcOffset {
        UtcOffset::from_whole_seconds(self.tasks.utc_offset_secs).unwrap_or(UtcOffset::UTC)
    }

    pub(crate) fn task_limits(&self) -> TaskLimits {
        TaskLimits { min_period_secs: self.tasks.min_period_secs, utc_offset: self.utc_offset() }
    }

    pub(crate) fn docker_enabled(&self) -> bool {
        !self.docker.disabled
    }
}
