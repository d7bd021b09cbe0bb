//! Layered settings loading.
//!
//! 1. Parse `defaults.toml` → base
//! 2. Apply `KEEL_*` environment variables
//! 3. Merge the settings file, if one is given and exists
//! 4. Deserialize → [`RuntimeSettings`]
//! 5. Validate

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, info};

use crate::env::{apply_env, collect_env_vars};
use crate::error::{ConfigError, ConfigResult};
use crate::merge::deep_merge;
use crate::types::RuntimeSettings;
use crate::validate;

/// Embedded default settings.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Maximum accepted settings file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// Load settings from defaults, the process environment and an optional
/// file.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file is malformed, an environment
/// variable cannot be coerced, or the result fails validation.
pub fn load(path: Option<&Path>) -> ConfigResult<RuntimeSettings> {
    load_with_env(path, &collect_env_vars())
}

/// Like [`load`], with an explicit environment snapshot.
///
/// # Errors
///
/// See [`load`].
pub fn load_with_env(
    path: Option<&Path>,
    env: &HashMap<String, String>,
) -> ConfigResult<RuntimeSettings> {
    let mut merged = parse(DEFAULTS_TOML, "<embedded defaults>")?;

    let env_count = apply_env(&mut merged, env)?;
    if env_count > 0 {
        debug!(count = env_count, "applied environment variables");
    }

    if let Some(path) = path
        && let Some(overlay) = try_load_file(path)?
    {
        deep_merge(&mut merged, &overlay);
        info!(path = %path.display(), "loaded settings file");
    }

    finish(merged)
}

/// Load settings from a TOML string layered over the defaults. The
/// environment is not consulted.
///
/// # Errors
///
/// Returns a [`ConfigError`] if `content` is malformed or the result fails
/// validation.
pub fn load_str(content: &str) -> ConfigResult<RuntimeSettings> {
    let mut merged = parse(DEFAULTS_TOML, "<embedded defaults>")?;
    deep_merge(&mut merged, &parse(content, "<string>")?);
    finish(merged)
}

fn finish(merged: toml::Value) -> ConfigResult<RuntimeSettings> {
    let settings: RuntimeSettings =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: "<merged settings>".to_owned(),
                source: e,
            })?;
    validate::validate(&settings)?;
    Ok(settings)
}

fn parse(content: &str, origin: &str) -> ConfigResult<toml::Value> {
    toml::from_str(content).map_err(|e| ConfigError::ParseError {
        path: origin.to_owned(),
        source: e,
    })
}

/// Read a file, returning `None` if it does not exist.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "settings file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    if content.len() as u64 > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "settings file is {} bytes, exceeding the {} byte limit",
                content.len(),
                MAX_CONFIG_FILE_SIZE
            ),
        });
    }

    parse(&content, &path.display().to_string()).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_only() {
        let settings = load_with_env(None, &HashMap::new()).unwrap();
        assert_eq!(settings, RuntimeSettings::default());
        assert_eq!(settings.deactivation_timeout().as_millis(), 10_000);
    }

    #[test]
    fn test_file_overrides_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[activation]\ndeactivation_timeout_ms = 500").unwrap();
        let env = HashMap::from([
            ("KEEL_DEACTIVATION_TIMEOUT_MS".to_owned(), "42".to_owned()),
            ("KEEL_LOG_LEVEL".to_owned(), "debug".to_owned()),
        ]);

        let settings = load_with_env(Some(file.path()), &env).unwrap();
        assert_eq!(settings.activation.deactivation_timeout_ms, 500);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn test_missing_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let settings =
            load_with_env(Some(&dir.path().join("keel.toml")), &HashMap::new()).unwrap();
        assert_eq!(settings.dispatcher.channel_capacity, 256);
    }

    #[test]
    fn test_malformed_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[activation\n").unwrap();
        let err = load_with_env(Some(file.path()), &HashMap::new()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_load_str_validates() {
        assert!(load_str("[logging]\nformat = \"json\"").is_ok());
        assert!(load_str("[logging]\nlevel = \"loud\"").is_err());
    }
}
