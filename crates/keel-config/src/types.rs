//! Settings struct definitions.
//!
//! All sections use `#[serde(default)]` so a partial file only needs to set
//! the keys it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level runtime settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Activation and deactivation behaviour.
    pub activation: ActivationSection,
    /// Configuration event dispatch.
    pub dispatcher: DispatcherSection,
    /// Logging and tracing.
    pub logging: LoggingSection,
}

impl RuntimeSettings {
    /// The bounded wait for an in-progress deactivation.
    #[must_use]
    pub fn deactivation_timeout(&self) -> Duration {
        Duration::from_millis(self.activation.deactivation_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// ActivationSection
// ---------------------------------------------------------------------------

/// Activation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationSection {
    /// How long an activation waits for an in-progress deactivation of the
    /// same configuration before failing with a timeout.
    pub deactivation_timeout_ms: u64,
}

impl Default for ActivationSection {
    fn default() -> Self {
        Self {
            deactivation_timeout_ms: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// DispatcherSection
// ---------------------------------------------------------------------------

/// Configuration event dispatch settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSection {
    /// Broadcast channel capacity; slower receivers drop the oldest events.
    pub channel_capacity: usize,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging and tracing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Global log level filter (`"trace"`, `"debug"`, `"info"`, `"warn"`,
    /// `"error"`).
    pub level: String,
    /// Output format: `"pretty"`, `"compact"` or `"json"`.
    pub format: String,
    /// Per-crate tracing directives (e.g. `["keel_runtime=debug"]`).
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "compact".to_owned(),
            directives: Vec::new(),
        }
    }
}
