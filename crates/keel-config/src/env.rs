//! Environment variable layer.
//!
//! `KEEL_*` variables sit between the embedded defaults and the settings
//! file: a value set in the file wins over the environment.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::merge::set_path;

/// Mapping from environment variable name to settings field path.
struct EnvMapping {
    var_name: &'static str,
    field_path: &'static str,
}

const ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        var_name: "KEEL_DEACTIVATION_TIMEOUT_MS",
        field_path: "activation.deactivation_timeout_ms",
    },
    EnvMapping {
        var_name: "KEEL_DISPATCHER_CHANNEL_CAPACITY",
        field_path: "dispatcher.channel_capacity",
    },
    EnvMapping {
        var_name: "KEEL_LOG_LEVEL",
        field_path: "logging.level",
    },
    EnvMapping {
        var_name: "KEEL_LOG_FORMAT",
        field_path: "logging.format",
    },
    EnvMapping {
        var_name: "KEEL_LOG_DIRECTIVES",
        field_path: "logging.directives",
    },
];

/// Snapshot the process environment's `KEEL_*` variables.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with("KEEL_"))
        .collect()
}

/// Apply mapped variables from `env` onto `merged`.
///
/// Each value is coerced to the type the field currently has in `merged`:
/// integers are parsed, arrays are split on commas, anything else is kept
/// as a string. Returns how many variables were applied.
///
/// # Errors
///
/// Returns [`ConfigError::EnvError`] if a numeric field gets a non-numeric
/// value.
pub fn apply_env(merged: &mut toml::Value, env: &HashMap<String, String>) -> ConfigResult<usize> {
    let mut applied: usize = 0;
    for mapping in ENV_MAPPINGS {
        let Some(raw) = env.get(mapping.var_name) else {
            continue;
        };
        let value = coerce(lookup(merged, mapping.field_path), mapping.var_name, raw)?;
        set_path(merged, mapping.field_path, value);
        debug!(var = mapping.var_name, field = mapping.field_path, "applied env var");
        applied = applied.saturating_add(1);
    }
    Ok(applied)
}

fn lookup<'a>(root: &'a toml::Value, path: &str) -> Option<&'a toml::Value> {
    path.split('.').try_fold(root, |v, segment| v.get(segment))
}

fn coerce(existing: Option<&toml::Value>, var_name: &str, raw: &str) -> ConfigResult<toml::Value> {
    match existing {
        Some(toml::Value::Integer(_)) => raw
            .trim()
            .parse::<i64>()
            .map(toml::Value::Integer)
            .map_err(|e| ConfigError::EnvError {
                var_name: var_name.to_owned(),
                message: format!("expected an integer: {e}"),
            }),
        Some(toml::Value::Array(_)) => Ok(toml::Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| toml::Value::String(s.to_owned()))
                .collect(),
        )),
        _ => Ok(toml::Value::String(raw.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> toml::Value {
        toml::from_str(include_str!("defaults.toml")).unwrap()
    }

    #[test]
    fn test_numeric_and_list_coercion() {
        let mut merged = defaults();
        let env = HashMap::from([
            ("KEEL_DEACTIVATION_TIMEOUT_MS".to_owned(), "250".to_owned()),
            (
                "KEEL_LOG_DIRECTIVES".to_owned(),
                "keel_runtime=debug, keel_registry=trace".to_owned(),
            ),
        ]);
        assert_eq!(apply_env(&mut merged, &env).unwrap(), 2);
        assert_eq!(
            merged["activation"]["deactivation_timeout_ms"].as_integer(),
            Some(250)
        );
        assert_eq!(merged["logging"]["directives"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_non_numeric_timeout_is_rejected() {
        let mut merged = defaults();
        let env = HashMap::from([("KEEL_DEACTIVATION_TIMEOUT_MS".to_owned(), "soon".to_owned())]);
        let err = apply_env(&mut merged, &env).unwrap_err();
        assert!(matches!(err, ConfigError::EnvError { .. }));
    }

    #[test]
    fn test_unmapped_variables_are_ignored() {
        let mut merged = defaults();
        let env = HashMap::from([("KEEL_UNKNOWN".to_owned(), "x".to_owned())]);
        assert_eq!(apply_env(&mut merged, &env).unwrap(), 0);
    }
}
