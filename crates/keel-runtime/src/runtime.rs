//! The component runtime: every registered component's manager.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use keel_config::{ConfigurationEvent, ConfigurationSource, RuntimeSettings};
use keel_core::{CapabilityRegistry, Sequence};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::descriptor::ComponentDescriptor;
use crate::dispatcher::ConfigurationDispatcher;
use crate::error::{ComponentError, ComponentResult};
use crate::manager::ComponentManager;

/// Hosts components against one capability registry and one
/// configuration source.
///
/// ```rust
/// use std::sync::Arc;
/// use keel_config::{ConfigurationStore, RuntimeSettings};
/// use keel_registry::ServiceRegistry;
/// use keel_runtime::{ComponentDescriptor, ComponentRuntime};
///
/// struct Clock;
///
/// let runtime = ComponentRuntime::new(
///     Arc::new(ServiceRegistry::new()),
///     Arc::new(ConfigurationStore::new()),
///     &RuntimeSettings::default(),
/// );
/// let descriptor = ComponentDescriptor::builder("clock", || Ok(Clock))
///     .provides("Clock")
///     .build()
///     .unwrap();
/// let manager = runtime.add_component(descriptor).unwrap();
/// assert_eq!(manager.configurations().len(), 1);
/// runtime.shutdown();
/// ```
pub struct ComponentRuntime {
    registry: Arc<dyn CapabilityRegistry>,
    source: Arc<dyn ConfigurationSource>,
    ids: Arc<Sequence>,
    deactivation_timeout: Duration,
    managers: RwLock<BTreeMap<String, Arc<ComponentManager>>>,
}

impl ComponentRuntime {
    /// Create an empty runtime.
    #[must_use]
    pub fn new(
        registry: Arc<dyn CapabilityRegistry>,
        source: Arc<dyn ConfigurationSource>,
        settings: &RuntimeSettings,
    ) -> Self {
        Self {
            registry,
            source,
            ids: Arc::new(Sequence::default()),
            deactivation_timeout: settings.deactivation_timeout(),
            managers: RwLock::new(BTreeMap::new()),
        }
    }

    /// The capability registry components bind against.
    #[must_use]
    pub fn registry(&self) -> &Arc<dyn CapabilityRegistry> {
        &self.registry
    }

    /// Bound on waiting for an in-progress deactivation.
    #[must_use]
    pub fn deactivation_timeout(&self) -> Duration {
        self.deactivation_timeout
    }

    /// Validate `descriptor`, add it and enable it.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::InvalidDescriptor`] if validation fails, or
    /// [`ComponentError::AlreadyRegistered`] if the name is taken.
    pub fn add_component(
        &self,
        descriptor: ComponentDescriptor,
    ) -> ComponentResult<Arc<ComponentManager>> {
        descriptor.validate()?;
        let name = descriptor.name().to_string();
        let manager = {
            let mut managers = self.managers.write().unwrap_or_else(PoisonError::into_inner);
            if managers.contains_key(&name) {
                return Err(ComponentError::AlreadyRegistered(name));
            }
            let manager = ComponentManager::new(
                Arc::new(descriptor),
                Arc::clone(&self.registry),
                Arc::clone(&self.source),
                Arc::clone(&self.ids),
                self.deactivation_timeout,
            );
            managers.insert(name.clone(), Arc::clone(&manager));
            manager
        };
        info!(component = %name, "component added");
        manager.enable();
        Ok(manager)
    }

    /// Disable and remove a component.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::NotFound`] for an unknown name.
    pub fn remove_component(&self, name: &str) -> ComponentResult<()> {
        let manager = self
            .managers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .ok_or_else(|| ComponentError::NotFound(name.to_string()))?;
        manager.disable();
        info!(component = %name, "component removed");
        Ok(())
    }

    /// Enable a disabled component.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::NotFound`] for an unknown name.
    pub fn enable(&self, name: &str) -> ComponentResult<()> {
        self.require(name)?.enable();
        Ok(())
    }

    /// Disable a component, disposing its configurations.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::NotFound`] for an unknown name.
    pub fn disable(&self, name: &str) -> ComponentResult<()> {
        self.require(name)?.disable();
        Ok(())
    }

    fn require(&self, name: &str) -> ComponentResult<Arc<ComponentManager>> {
        self.component(name)
            .ok_or_else(|| ComponentError::NotFound(name.to_string()))
    }

    /// The manager for component `name`.
    #[must_use]
    pub fn component(&self, name: &str) -> Option<Arc<ComponentManager>> {
        self.managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Names of every added component.
    #[must_use]
    pub fn components(&self) -> Vec<String> {
        self.managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Route a configuration record change to every component. A failing
    /// component is logged and does not stop delivery to the others.
    pub fn configuration_event(&self, event: &ConfigurationEvent) {
        let managers: Vec<Arc<ComponentManager>> = self
            .managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for manager in managers {
            if let Err(e) = manager.configuration_event(event) {
                error!(
                    component = %manager.name(),
                    pid = %event.pid,
                    error = %e,
                    "configuration event failed"
                );
            }
        }
    }

    /// Spawn a dispatcher applying `events` to this runtime.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_dispatcher(
        self: &Arc<Self>,
        events: broadcast::Receiver<ConfigurationEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(ConfigurationDispatcher::new(Arc::clone(self), events).run())
    }

    /// Disable every component, in reverse name order, and drop them.
    pub fn shutdown(&self) {
        let managers = std::mem::take(
            &mut *self.managers.write().unwrap_or_else(PoisonError::into_inner),
        );
        for manager in managers.values().rev() {
            manager.disable();
        }
        info!(components = managers.len(), "component runtime shut down");
    }
}

impl fmt::Debug for ComponentRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRuntime")
            .field("components", &self.components())
            .field("deactivation_timeout", &self.deactivation_timeout)
            .finish_non_exhaustive()
    }
}
