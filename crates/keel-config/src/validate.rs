//! Post-merge settings validation.

use crate::error::{ConfigError, ConfigResult};
use crate::types::RuntimeSettings;

/// Longest accepted deactivation wait (10 minutes).
const MAX_DEACTIVATION_TIMEOUT_MS: u64 = 600_000;

/// Validate fully merged and deserialized settings.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(settings: &RuntimeSettings) -> ConfigResult<()> {
    validate_activation(settings)?;
    validate_dispatcher(settings)?;
    validate_logging(settings)?;
    Ok(())
}

fn validate_activation(settings: &RuntimeSettings) -> ConfigResult<()> {
    let timeout = settings.activation.deactivation_timeout_ms;
    if timeout == 0 || timeout > MAX_DEACTIVATION_TIMEOUT_MS {
        return Err(ConfigError::ValidationError {
            field: "activation.deactivation_timeout_ms".to_owned(),
            message: format!("must be between 1 and {MAX_DEACTIVATION_TIMEOUT_MS}"),
        });
    }
    Ok(())
}

fn validate_dispatcher(settings: &RuntimeSettings) -> ConfigResult<()> {
    if settings.dispatcher.channel_capacity == 0 {
        return Err(ConfigError::ValidationError {
            field: "dispatcher.channel_capacity".to_owned(),
            message: "must be at least 1".to_owned(),
        });
    }
    Ok(())
}

fn validate_logging(settings: &RuntimeSettings) -> ConfigResult<()> {
    let logging = &settings.logging;
    if !matches!(
        logging.level.to_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    ) {
        return Err(ConfigError::ValidationError {
            field: "logging.level".to_owned(),
            message: format!(
                "unsupported level '{}'; expected one of: trace, debug, info, warn, error",
                logging.level
            ),
        });
    }
    if !matches!(
        logging.format.to_lowercase().as_str(),
        "pretty" | "compact" | "json"
    ) {
        return Err(ConfigError::ValidationError {
            field: "logging.format".to_owned(),
            message: format!(
                "unsupported format '{}'; expected one of: pretty, compact, json",
                logging.format
            ),
        });
    }
    Ok(())
}
