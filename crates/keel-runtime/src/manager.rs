//! Component managers: one per descriptor, reconciling the set of live
//! configurations against configuration records and dependency
//! satisfaction.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use keel_config::{ConfigurationChange, ConfigurationEvent, ConfigurationSource};
use keel_core::{CapabilityRegistry, ComponentId, Properties, RecordKey, Sequence};
use tracing::{debug, info, warn};

use crate::configuration::{ComponentConfiguration, ConfigurationUpdate};
use crate::dependency::{Dependency, DependencyObserver, ListenerChange};
use crate::descriptor::{ComponentDescriptor, ConfigurationPolicy};
use crate::error::ComponentResult;
use crate::state::DeactivationReason;

#[derive(Default)]
struct ManagerState {
    enabled: bool,
    dependencies: Vec<Arc<Dependency>>,
    records: BTreeMap<RecordKey, Properties>,
    configurations: BTreeMap<RecordKey, Arc<ComponentConfiguration>>,
}

/// Owns the dependencies of one component and the configurations built
/// from them.
///
/// Configuration methods are never called with the manager's lock held.
pub struct ComponentManager {
    me: Weak<Self>,
    descriptor: Arc<ComponentDescriptor>,
    registry: Arc<dyn CapabilityRegistry>,
    source: Arc<dyn ConfigurationSource>,
    ids: Arc<Sequence>,
    deactivation_timeout: Duration,
    state: Mutex<ManagerState>,
}

impl ComponentManager {
    pub(crate) fn new(
        descriptor: Arc<ComponentDescriptor>,
        registry: Arc<dyn CapabilityRegistry>,
        source: Arc<dyn ConfigurationSource>,
        ids: Arc<Sequence>,
        deactivation_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            descriptor,
            registry,
            source,
            ids,
            deactivation_timeout,
            state: Mutex::new(ManagerState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The managed descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &Arc<ComponentDescriptor> {
        &self.descriptor
    }

    /// Component name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    /// Whether the component is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Live configurations, in record key order.
    #[must_use]
    pub fn configurations(&self) -> Vec<Arc<ComponentConfiguration>> {
        self.lock().configurations.values().cloned().collect()
    }

    /// The configuration for `key`, if one exists.
    #[must_use]
    pub fn configuration(&self, key: &RecordKey) -> Option<Arc<ComponentConfiguration>> {
        self.lock().configurations.get(key).cloned()
    }

    /// The dependency tracking reference `name`, while enabled.
    #[must_use]
    pub fn dependency(&self, name: &str) -> Option<Arc<Dependency>> {
        self.lock()
            .dependencies
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }

    /// Record keys the component currently wants configurations for.
    #[must_use]
    pub fn record_keys(&self) -> Vec<RecordKey> {
        self.lock().records.keys().cloned().collect()
    }

    /// Create the dependencies, read the initial records and build every
    /// satisfiable configuration.
    pub fn enable(&self) {
        let dependencies = {
            let mut state = self.lock();
            if state.enabled {
                return;
            }
            let observer: Weak<dyn DependencyObserver> = self.me.clone();
            state.dependencies = self
                .descriptor
                .references()
                .iter()
                .enumerate()
                .map(|(index, reference)| {
                    Dependency::new(
                        index,
                        self.descriptor.name(),
                        reference.clone(),
                        self.descriptor.ranking_rule(),
                        Arc::clone(&self.registry),
                        observer.clone(),
                    )
                })
                .collect();
            state.enabled = true;
            state.dependencies.clone()
        };
        for dependency in &dependencies {
            dependency.open();
        }

        let records = self.initial_records();
        {
            let mut state = self.lock();
            state.records = records.clone();
        }
        for (key, properties) in &records {
            for dependency in &dependencies {
                dependency.record_changed(key, properties);
            }
        }
        info!(
            component = %self.descriptor.name(),
            records = records.len(),
            "component enabled"
        );
        for key in records.keys() {
            self.reconcile(key);
        }
    }

    /// Dispose every configuration and stop every listener.
    pub fn disable(&self) {
        let (configurations, dependencies) = {
            let mut state = self.lock();
            if !state.enabled {
                return;
            }
            state.enabled = false;
            state.records.clear();
            (
                std::mem::take(&mut state.configurations),
                std::mem::take(&mut state.dependencies),
            )
        };
        for configuration in configurations.values().rev() {
            configuration.dispose(DeactivationReason::Disabled);
        }
        for dependency in &dependencies {
            dependency.stop_all();
        }
        info!(component = %self.descriptor.name(), "component disabled");
    }

    fn initial_records(&self) -> BTreeMap<RecordKey, Properties> {
        let mut records = BTreeMap::new();
        let policy = self.descriptor.configuration_policy();
        if policy != ConfigurationPolicy::Ignore {
            for record in self.source.records_for(self.descriptor.pid()) {
                records.insert(RecordKey::pid(record.pid), record.properties);
            }
        }
        if records.is_empty() && policy != ConfigurationPolicy::Require {
            records.insert(RecordKey::Unconfigured, Properties::new());
        }
        records
    }

    /// Apply one configuration record change.
    ///
    /// # Errors
    ///
    /// Returns the error of a failing modified hook.
    pub fn configuration_event(&self, event: &ConfigurationEvent) -> ComponentResult<()> {
        if event.target_pid() != self.descriptor.pid()
            || self.descriptor.configuration_policy() == ConfigurationPolicy::Ignore
            || !self.is_enabled()
        {
            return Ok(());
        }
        let key = RecordKey::pid(event.pid.as_str());
        debug!(
            component = %self.descriptor.name(),
            pid = %event.pid,
            "configuration event"
        );
        match &event.change {
            ConfigurationChange::Updated(properties) => self.record_updated(&key, properties),
            ConfigurationChange::Deleted => {
                self.record_deleted(&key);
                Ok(())
            },
        }
    }

    fn record_updated(&self, key: &RecordKey, properties: &Properties) -> ComponentResult<()> {
        let (existing, replaces_unconfigured, unconfigured, dependencies) = {
            let mut state = self.lock();
            state.records.insert(key.clone(), properties.clone());
            let replaces_unconfigured = state.records.remove(&RecordKey::Unconfigured).is_some();
            let unconfigured = state.configurations.remove(&RecordKey::Unconfigured);
            (
                state.configurations.get(key).cloned(),
                replaces_unconfigured,
                unconfigured,
                state.dependencies.clone(),
            )
        };

        // The first record replaces the unconfigured configuration.
        if let Some(configuration) = unconfigured {
            configuration.dispose(DeactivationReason::ConfigurationModified);
        }
        if replaces_unconfigured {
            for dependency in &dependencies {
                dependency.remove_record(&RecordKey::Unconfigured);
            }
        }

        let changes: Vec<ListenerChange> = dependencies
            .iter()
            .filter_map(|dependency| dependency.record_changed(key, properties))
            .collect();

        let Some(configuration) = existing else {
            self.reconcile(key);
            return Ok(());
        };

        if !self.satisfied(&dependencies, key) {
            self.retire(&configuration, DeactivationReason::ReferenceUnsatisfied);
            return Ok(());
        }
        match configuration.configuration_changed(Some(properties.clone()))? {
            ConfigurationUpdate::Disposed => {
                self.forget(&configuration);
                self.reconcile(key);
            },
            ConfigurationUpdate::Updated => {
                for change in changes {
                    configuration.reference_changed(change.index, &change.delta);
                }
            },
        }
        Ok(())
    }

    fn record_deleted(&self, key: &RecordKey) {
        let (configuration, fallback, dependencies) = {
            let mut state = self.lock();
            if state.records.remove(key).is_none() {
                return;
            }
            let fallback = self.descriptor.configuration_policy() == ConfigurationPolicy::Optional
                && state.records.is_empty();
            if fallback {
                state
                    .records
                    .insert(RecordKey::Unconfigured, Properties::new());
            }
            (
                state.configurations.remove(key),
                fallback,
                state.dependencies.clone(),
            )
        };

        if let Some(configuration) = configuration {
            configuration.dispose(DeactivationReason::ConfigurationDeleted);
        }
        for dependency in &dependencies {
            dependency.remove_record(key);
        }
        if fallback {
            for dependency in &dependencies {
                dependency.record_changed(&RecordKey::Unconfigured, &Properties::new());
            }
            self.reconcile(&RecordKey::Unconfigured);
        }
    }

    fn satisfied(&self, dependencies: &[Arc<Dependency>], key: &RecordKey) -> bool {
        dependencies.iter().all(|dependency| {
            let available = dependency.reference().is_optional() || dependency.is_available_for(key);
            if !available {
                debug!(
                    component = %self.descriptor.name(),
                    reference = dependency.name(),
                    key = %key,
                    "mandatory reference unsatisfied"
                );
            }
            available
        })
    }

    /// Create and start the configuration for `key` if the record is wanted,
    /// none exists yet and every mandatory reference is satisfied.
    fn reconcile(&self, key: &RecordKey) {
        let configuration = {
            let mut state = self.lock();
            if !state.enabled || state.configurations.contains_key(key) {
                return;
            }
            let Some(properties) = state.records.get(key).cloned() else {
                return;
            };
            if !self.satisfied(&state.dependencies, key) {
                return;
            }
            let configuration = ComponentConfiguration::new(
                ComponentId(self.ids.next_value()),
                Arc::clone(&self.descriptor),
                key.clone(),
                properties,
                Arc::clone(&self.registry),
                state.dependencies.clone().into(),
                self.deactivation_timeout,
            );
            state
                .configurations
                .insert(key.clone(), Arc::clone(&configuration));
            configuration
        };

        info!(
            component = %self.descriptor.name(),
            component_id = %configuration.id(),
            key = %key,
            "component configuration created"
        );
        if let Err(e) = configuration.start() {
            warn!(
                component = %self.descriptor.name(),
                component_id = %configuration.id(),
                error = %e,
                "component configuration failed to start"
            );
            self.retire(&configuration, DeactivationReason::Disposed);
        }
    }

    /// Drop the configuration from the map, then dispose it. A provider
    /// arriving while the dispose runs reconciles against an empty slot.
    fn retire(&self, configuration: &Arc<ComponentConfiguration>, reason: DeactivationReason) {
        self.forget(configuration);
        configuration.dispose(reason);
    }

    fn forget(&self, configuration: &Arc<ComponentConfiguration>) {
        let mut state = self.lock();
        let key = configuration.record_key();
        if state
            .configurations
            .get(key)
            .is_some_and(|c| Arc::ptr_eq(c, configuration))
        {
            state.configurations.remove(key);
        }
    }
}

impl DependencyObserver for ComponentManager {
    fn dependency_changed(&self, change: ListenerChange) {
        let Some(reference) = self.descriptor.references().get(change.index) else {
            return;
        };
        for key in &change.keys {
            let configuration = {
                let state = self.lock();
                if !state.enabled {
                    return;
                }
                state.configurations.get(key).cloned()
            };
            match configuration {
                Some(configuration) => {
                    if !reference.is_optional() && change.was_available && !change.is_available {
                        info!(
                            component = %self.descriptor.name(),
                            component_id = %configuration.id(),
                            reference = reference.name(),
                            "mandatory reference lost its last provider"
                        );
                        self.retire(&configuration, DeactivationReason::ReferenceUnsatisfied);
                    } else if !change.delta.is_empty() {
                        configuration.reference_changed(change.index, &change.delta);
                    }
                },
                None if change.is_available => self.reconcile(key),
                None => {},
            }
        }
    }
}

impl fmt::Debug for ComponentManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ComponentManager")
            .field("component", &self.descriptor.name())
            .field("enabled", &state.enabled)
            .field("configurations", &state.configurations.len())
            .finish_non_exhaustive()
    }
}
