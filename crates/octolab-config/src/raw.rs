use std::env;

use crate::error::ConfigError;

pub fn required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing(key.to_string()))
}

pub fn optional(key: &str) -> Option<String> {
    env::var(key).ok()
}

pub fn required_bool(key: &str) -> Result<bool, ConfigError> {
    parse_bool(key, &required(key)?)
}

pub fn bool_with_default(key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional(key) {
        Some(raw) => parse_bool(key, &raw),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid {
            key: key.to_string(),
            message: format!("'{other}' is not a recognized boolean"),
        }),
    }
}

pub fn required_u32(key: &str) -> Result<u32, ConfigError> {
    required(key)?
        .trim()
        .parse::<u32>()
        .map_err(|e| ConfigError::Invalid {
            key: key.to_string(),
            message: e.to_string(),
        })
}

pub fn u32_with_default(key: &str, default: u32) -> Result<u32, ConfigError> {
    match optional(key) {
        Some(raw) => raw.trim().parse::<u32>().map_err(|e| ConfigError::Invalid {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

pub fn required_u16(key: &str) -> Result<u16, ConfigError> {
    required(key)?
        .trim()
        .parse::<u16>()
        .map_err(|e| ConfigError::Invalid {
            key: key.to_string(),
            message: e.to_string(),
        })
}

pub fn string_list(key: &str) -> Vec<String> {
    optional(key)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
