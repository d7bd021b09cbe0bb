//! Provider and settings fixtures.

use std::sync::Arc;
use std::time::Duration;

use keel_config::RuntimeSettings;
use keel_core::{ConsumerId, Properties, keys};
use keel_registry::{ServiceRegistration, ServiceRegistry};

/// Interface name the greeter fixtures register under.
pub const GREETER: &str = "Greeter";

/// A trivial provided object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeter {
    name: String,
}

impl Greeter {
    /// Create a greeter.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The greeter's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Greet `who`.
    #[must_use]
    pub fn greet(&self, who: &str) -> String {
        format!("{}: hello, {who}", self.name)
    }
}

/// Properties for a greeter registration.
#[must_use]
pub fn greeter_properties(name: &str, ranking: i32) -> Properties {
    Properties::new()
        .with("name", name)
        .with(keys::SERVICE_RANKING, ranking)
}

/// Register a [`Greeter`] named `name` with `ranking`.
///
/// # Panics
///
/// Panics if the registry rejects the registration.
#[must_use]
pub fn register_greeter(registry: &ServiceRegistry, name: &str, ranking: i32) -> ServiceRegistration {
    registry
        .register_object(
            &[GREETER],
            Arc::new(Greeter::new(name)),
            greeter_properties(name, ranking),
        )
        .expect("greeter registration failed")
}

/// A consumer id unique to this call.
#[must_use]
pub fn test_consumer() -> ConsumerId {
    ConsumerId::new(format!("test-consumer-{}", uuid::Uuid::new_v4()))
}

/// Default settings with a short deactivation bound, logging at `warn`.
#[must_use]
pub fn test_settings(deactivation_timeout: Duration) -> RuntimeSettings {
    let mut settings = RuntimeSettings::default();
    settings.activation.deactivation_timeout_ms =
        u64::try_from(deactivation_timeout.as_millis()).unwrap_or(u64::MAX);
    settings.logging.level = "warn".to_string();
    settings
}
