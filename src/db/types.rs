use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ServerRole {
    #[default]
    Unknown,
    User,
    Creator,
    Admin,
    Owner,
    Root,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum CourseRole {
    #[default]
    Unknown,
    Other,
    Student,
    Grader,
    Admin,
    Owner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
    Off,
}

impl ServerRole {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ServerRole::Unknown => "unknown",
            ServerRole::User => "user",
            ServerRole::Creator => "creator",
            ServerRole::Admin => "admin",
            ServerRole::Owner => "owner",
            ServerRole::Root => "root",
        }
    }
}

impl CourseRole {
    /// Every role a course member can hold, lowest first.
    pub(crate) const ENROLLED: [CourseRole; 5] = [
        CourseRole::Other,
        CourseRole::Student,
        CourseRole::Grader,
        CourseRole::Admin,
        CourseRole::Owner,
    ];

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            CourseRole::Unknown => "unknown",
            CourseRole::Other => "other",
            CourseRole::Student => "student",
            CourseRole::Grader => "grader",
            CourseRole::Admin => "admin",
            CourseRole::Owner => "owner",
        }
    }
}

impl LogLevel {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
            LogLevel::Off => "off",
        }
    }
}

impl FromStr for ServerRole {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "user" => Ok(ServerRole::User),
            "creator" => Ok(ServerRole::Creator),
            "admin" => Ok(ServerRole::Admin),
            "owner" => Ok(ServerRole::Owner),
            "root" => Ok(ServerRole::Root),
            other => Err(ModelError::UnknownRole(other.to_string())),
        }
    }
}

impl FromStr for CourseRole {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "other" => Ok(CourseRole::Other),
            "student" => Ok(CourseRole::Student),
            "grader" => Ok(CourseRole::Grader),
            "admin" => Ok(CourseRole::Admin),
            "owner" => Ok(CourseRole::Owner),
            other => Err(ModelError::UnknownRole(other.to_string())),
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "fatal" => Ok(LogLevel::Fatal),
            "off" => Ok(LogLevel::Off),
            other => Err(format!("Unknown log level '{other}'.")),
        }
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for CourseRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
