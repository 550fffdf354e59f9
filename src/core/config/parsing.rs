use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::types::ConfigError;

pub(crate) const ENV_PREFIX: &str = "AUTOGRADER__";

/// Flat `dotted.key -> value` view of every source.
pub(crate) type ConfigMap = BTreeMap<String, String>;

pub(super) fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

/// Merge a JSON config file. Nested objects become dotted keys.
pub(super) fn merge_file(map: &mut ConfigMap, path: &Path, required: bool) -> Result<(), ConfigError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if !required && err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(ConfigError::File {
                path: path.display().to_string(),
                message: err.to_string(),
            })
        }
    };

    let value: serde_json::Value = serde_json::from_str(&text).map_err(|err| ConfigError::File {
        path: path.display().to_string(),
        message: err.to_string(),
    })?;

    flatten_json("", &value, map);
    Ok(())
}

fn flatten_json(prefix: &str, value: &serde_json::Value, map: &mut ConfigMap) {
    match value {
        serde_json::Value::Object(entries) => {
            for (key, child) in entries {
                let key = if prefix.is_empty() {
                    normalize_key(key)
                } else {
                    format!("{prefix}.{}", normalize_key(key))
                };
                flatten_json(&key, child, map);
            }
        }
        serde_json::Value::String(text) => {
            map.insert(prefix.to_string(), text.clone());
        }
        serde_json::Value::Null => {
            map.remove(prefix);
        }
        other => {
            map.insert(prefix.to_string(), other.to_string());
        }
    }
}

pub(super) fn merge_env<I>(map: &mut ConfigMap, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, value) in vars {
        let Some(stripped) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };

        map.insert(normalize_key(&stripped.replace("__", ".")), value.trim().to_string());
    }
}

pub(super) fn merge_override(map: &mut ConfigMap, raw: &str) -> Result<(), ConfigError> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(ConfigError::InvalidOverride(raw.to_string()));
    };

    let key = normalize_key(key);
    if key.is_empty() {
        return Err(ConfigError::InvalidOverride(raw.to_string()));
    }

    map.insert(key, value.trim().to_string());
    Ok(())
}

pub(super) fn get_optional<'a>(map: &'a ConfigMap, key: &str) -> Option<&'a str> {
    map.get(key).map(|value| value.trim()).filter(|value| !value.is_empty())
}

pub(super) fn get_or_default(map: &ConfigMap, key: &str, default: &str) -> String {
    get_optional(map, key).unwrap_or(default).to_string()
}

pub(super) fn parse_bool(key: &str, map: &ConfigMap, default: bool) -> Result<bool, ConfigError> {
    let Some(value) = get_optional(map, key) else {
        return Ok(default);
    };

    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

pub(super) fn parse_u64(key: &str, map: &ConfigMap, default: u64) -> Result<u64, ConfigError> {
    match get_optional(map, key) {
        None => Ok(default),
        Some(value) => value.parse::<u64>().map_err(|_| invalid(key, value)),
    }
}

pub(super) fn parse_u16(key: &str, map: &ConfigMap, default: u16) -> Result<u16, ConfigError> {
    match get_optional(map, key) {
        None => Ok(default),
        Some(value) => value.parse::<u16>().map_err(|_| invalid(key, value)),
    }
}

pub(super) fn parse_i32(key: &str, map: &ConfigMap, default: i32) -> Result<i32, ConfigError> {
    match get_optional(map, key) {
        None => Ok(default),
        Some(value) => value.parse::<i32>().map_err(|_| invalid(key, value)),
    }
}

pub(super) fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue { key: key.to_string(), value: value.to_string() }
}
