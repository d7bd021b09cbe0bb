#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
//! Settings and configuration records for the Keel component runtime.
//!
//! Two unrelated kinds of configuration live here:
//!
//! - [`RuntimeSettings`]: how the runtime itself behaves (deactivation
//!   timeout, dispatcher capacity, logging), loaded once at startup.
//! - [`ConfigurationStore`]: the per-component configuration records that
//!   drive which component configurations exist, changing at runtime.
//!
//! # Usage
//!
//! ```rust
//! use keel_config::RuntimeSettings;
//!
//! let settings = RuntimeSettings::load_str("[activation]\ndeactivation_timeout_ms = 250").unwrap();
//! assert_eq!(settings.deactivation_timeout().as_millis(), 250);
//! ```
//!
//! # Settings Precedence
//!
//! From highest to lowest priority:
//!
//! 1. **Settings file** passed to [`RuntimeSettings::load`]
//! 2. **Environment variables** (`KEEL_*`)
//! 3. **Embedded defaults** (`defaults.toml` compiled into the binary)

/// Environment variable layer.
pub mod env;
/// Configuration error types.
pub mod error;
/// Layered settings loading.
pub mod loader;
/// TOML tree merging.
pub mod merge;
/// Configuration record store.
pub mod records;
/// Settings struct definitions.
pub mod types;
/// Settings validation rules.
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use records::{
    ConfigurationChange, ConfigurationEvent, ConfigurationRecord, ConfigurationSource,
    ConfigurationStore,
};
pub use types::*;

impl RuntimeSettings {
    /// Load settings from defaults, `KEEL_*` variables and an optional file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file is malformed or the settings
    /// fail validation.
    pub fn load(path: Option<&std::path::Path>) -> ConfigResult<Self> {
        loader::load(path)
    }

    /// Load settings from a TOML string layered over the defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the string is malformed or the settings
    /// fail validation.
    pub fn load_str(content: &str) -> ConfigResult<Self> {
        loader::load_str(content)
    }
}
