//! A wired-up runtime for tests.

use std::io::Write;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use keel_config::{
    ConfigurationChange, ConfigurationEvent, ConfigurationRecord, ConfigurationSource,
    ConfigurationStore, LoggingSection, RuntimeSettings,
};
use keel_core::{CapabilityRegistry, Properties};
use keel_registry::ServiceRegistry;
use keel_runtime::ComponentRuntime;
use keel_telemetry::{LogConfig, setup_logging};
use tempfile::TempDir;

use crate::fixtures::test_settings;

/// Deactivation bound used by [`TestRuntime::new`].
pub const TEST_DEACTIVATION_TIMEOUT: Duration = Duration::from_millis(250);

static LOGGING: Once = Once::new();

/// Install a stderr subscriber at `warn` once per test binary.
/// `KEEL_TEST_LOG` overrides the level.
pub fn init_test_logging() {
    init_logging(&test_settings(TEST_DEACTIVATION_TIMEOUT).logging);
}

/// Install a stderr subscriber described by a `[logging]` section once per
/// test binary. The first caller wins; `KEEL_TEST_LOG` overrides the level.
pub fn init_logging(section: &LoggingSection) {
    LOGGING.call_once(|| {
        let config = test_log_config(section, std::env::var("KEEL_TEST_LOG").ok());
        // Another harness may already own the global subscriber.
        let _ = setup_logging(&config);
    });
}

fn test_log_config(section: &LoggingSection, level: Option<String>) -> LogConfig {
    let mut config = LogConfig::from(section).without_ansi().with_thread_ids();
    if let Some(level) = level {
        config.level = level;
    }
    config
}

/// Registry, configuration store and runtime wired together.
///
/// Configuration helpers apply changes synchronously, so tests observe the
/// result without running a dispatcher.
#[derive(Debug)]
pub struct TestRuntime {
    /// The capability registry.
    pub registry: Arc<ServiceRegistry>,
    /// The configuration record store.
    pub store: Arc<ConfigurationStore>,
    /// The component runtime.
    pub runtime: Arc<ComponentRuntime>,
}

impl TestRuntime {
    /// A runtime with [`TEST_DEACTIVATION_TIMEOUT`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(&test_settings(TEST_DEACTIVATION_TIMEOUT))
    }

    /// A runtime built from `settings`.
    #[must_use]
    pub fn with_settings(settings: &RuntimeSettings) -> Self {
        init_logging(&settings.logging);
        let registry = Arc::new(ServiceRegistry::new());
        let store = Arc::new(ConfigurationStore::with_capacity(
            settings.dispatcher.channel_capacity,
        ));
        let runtime = Arc::new(ComponentRuntime::new(
            Arc::clone(&registry) as Arc<dyn CapabilityRegistry>,
            Arc::clone(&store) as Arc<dyn ConfigurationSource>,
            settings,
        ));
        Self {
            registry,
            store,
            runtime,
        }
    }

    /// A runtime whose settings are loaded from a TOML file holding
    /// `contents`.
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be written or the settings do not load.
    #[must_use]
    pub fn from_settings_file(contents: &str) -> Self {
        let dir = TempDir::new().expect("failed to create tempdir");
        let path = dir.path().join("keel.toml");
        let mut file = std::fs::File::create(&path).expect("failed to create settings file");
        file.write_all(contents.as_bytes())
            .expect("failed to write settings file");
        let settings = RuntimeSettings::load(Some(&path)).expect("settings failed to load");
        Self::with_settings(&settings)
    }

    /// Create or replace record `pid` and deliver the change.
    pub fn update_config(&self, pid: &str, properties: Properties) -> ConfigurationRecord {
        let record = self.store.update(pid, properties);
        self.deliver(&record, ConfigurationChange::Updated(record.properties.clone()));
        record
    }

    /// Create a factory record for `factory_pid` and deliver the change.
    pub fn create_factory_config(
        &self,
        factory_pid: &str,
        properties: Properties,
    ) -> ConfigurationRecord {
        let record = self.store.create_factory_configuration(factory_pid, properties);
        self.deliver(&record, ConfigurationChange::Updated(record.properties.clone()));
        record
    }

    /// Delete record `pid` and deliver the change.
    pub fn delete_config(&self, pid: &str) -> Option<ConfigurationRecord> {
        let record = self.store.delete(pid)?;
        self.deliver(&record, ConfigurationChange::Deleted);
        Some(record)
    }

    fn deliver(&self, record: &ConfigurationRecord, change: ConfigurationChange) {
        self.runtime.configuration_event(&ConfigurationEvent {
            pid: record.pid.clone(),
            factory_pid: record.factory_pid.clone(),
            change,
        });
    }
}

impl Default for TestRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestRuntime {
    fn drop(&mut self) {
        self.runtime.shutdown();
    }
}

/// Poll `condition` every 10 ms until it holds or `timeout` passes.
/// Returns whether it held.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now()
        .checked_add(timeout)
        .unwrap_or_else(Instant::now);
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
