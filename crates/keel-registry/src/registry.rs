//! In-memory capability registry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tracing::{debug, trace, warn};

use keel_core::{
    CapabilityRegistry, ConsumerId, Filter, Properties, PropertyValue, ProviderId, ProviderRef,
    ProviderSource, Registration, RegistryError, RegistryEvent, RegistryListener, RegistryResult,
    Sequence, ServiceObject, SubscriptionId, keys,
};

type Delivery = (SubscriptionId, Weak<dyn RegistryListener>, RegistryEvent);

/// Registry of providers with synchronous, filter-scoped change delivery.
///
/// Listeners are called on the thread that changed the registry, after the
/// registry lock has been released, so a listener may call back into the
/// registry. Cloning the registry shares its state.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: RwLock<State>,
    provider_ids: Sequence,
    subscription_ids: Sequence,
}

#[derive(Default)]
struct State {
    providers: BTreeMap<ProviderId, Entry>,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
}

struct Entry {
    reference: ProviderRef,
    interfaces: Vec<String>,
    source: ProviderSource,
    unregistering: bool,
}

struct Subscription {
    filter: Filter,
    listener: Weak<dyn RegistryListener>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider and keep the concrete handle.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidRegistration`] if `interfaces` is empty.
    pub fn register_provider(
        &self,
        interfaces: &[String],
        source: ProviderSource,
        properties: Properties,
    ) -> RegistryResult<ServiceRegistration> {
        if interfaces.is_empty() {
            return Err(RegistryError::InvalidRegistration(
                "at least one interface is required".into(),
            ));
        }
        let id = ProviderId(self.inner.provider_ids.next_value());
        let reference = ProviderRef::new(id, stamp(properties, interfaces, id));

        let deliveries = {
            let mut state = self.inner.write();
            state.providers.insert(
                id,
                Entry {
                    reference: reference.clone(),
                    interfaces: interfaces.to_vec(),
                    source,
                    unregistering: false,
                },
            );
            state
                .subscriptions
                .iter()
                .filter(|(_, sub)| sub.filter.matches(reference.properties()))
                .map(|(sid, sub)| {
                    (
                        *sid,
                        Weak::clone(&sub.listener),
                        RegistryEvent::Registered(reference.clone()),
                    )
                })
                .collect::<Vec<_>>()
        };

        debug!(provider_id = %id, interfaces = ?interfaces, "Registered provider");
        self.inner.deliver(deliveries);

        Ok(ServiceRegistration {
            registry: Arc::downgrade(&self.inner),
            id,
            reference: RwLock::new(reference),
            unregistered: AtomicBool::new(false),
        })
    }

    /// Convenience: register a plain object under one or more interfaces.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidRegistration`] if `interfaces` is empty.
    pub fn register_object(
        &self,
        interfaces: &[&str],
        object: ServiceObject,
        properties: Properties,
    ) -> RegistryResult<ServiceRegistration> {
        let interfaces: Vec<String> = interfaces.iter().map(|s| (*s).to_owned()).collect();
        self.register_provider(&interfaces, ProviderSource::Object(object), properties)
    }

    /// Number of registered providers.
    #[must_use]
    pub fn provider_count(&self) -> usize {
        self.inner.read().providers.len()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.read().subscriptions.len()
    }

    /// Filters of all live subscriptions, in subscription order.
    #[must_use]
    pub fn subscription_filters(&self) -> Vec<Filter> {
        self.inner
            .read()
            .subscriptions
            .values()
            .map(|s| s.filter.clone())
            .collect()
    }
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, deliveries: Vec<Delivery>) {
        let mut dead = Vec::new();
        for (sid, listener, event) in deliveries {
            if let Some(listener) = listener.upgrade() {
                trace!(
                    subscription = %sid,
                    provider_id = %event.provider().id(),
                    event = event.kind(),
                    "Delivering registry event"
                );
                listener.registry_changed(&event);
            } else {
                dead.push(sid);
            }
        }
        if !dead.is_empty() {
            let mut state = self.write();
            for sid in dead {
                state.subscriptions.remove(&sid);
            }
        }
    }

    fn modify(&self, id: ProviderId, properties: Properties) -> RegistryResult<ProviderRef> {
        let (updated, deliveries) = {
            let mut state = self.write();
            let State {
                providers,
                subscriptions,
            } = &mut *state;
            let entry = providers.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
            let previous = entry.reference.clone();
            let updated = ProviderRef::new(id, stamp(properties, &entry.interfaces, id));
            entry.reference = updated.clone();

            let deliveries = subscriptions
                .iter()
                .filter_map(|(sid, sub)| {
                    let before = sub.filter.matches(previous.properties());
                    let after = sub.filter.matches(updated.properties());
                    let event = if after {
                        RegistryEvent::Modified(updated.clone())
                    } else if before {
                        RegistryEvent::ModifiedEndMatch(updated.clone())
                    } else {
                        return None;
                    };
                    Some((*sid, Weak::clone(&sub.listener), event))
                })
                .collect::<Vec<_>>();
            (updated, deliveries)
        };

        debug!(provider_id = %id, "Modified provider properties");
        self.deliver(deliveries);
        Ok(updated)
    }

    fn unregister(&self, id: ProviderId) -> RegistryResult<()> {
        let deliveries = {
            let mut state = self.write();
            let State {
                providers,
                subscriptions,
            } = &mut *state;
            let entry = providers.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
            entry.unregistering = true;
            let reference = entry.reference.clone();
            subscriptions
                .iter()
                .filter(|(_, sub)| sub.filter.matches(reference.properties()))
                .map(|(sid, sub)| {
                    (
                        *sid,
                        Weak::clone(&sub.listener),
                        RegistryEvent::Unregistering(reference.clone()),
                    )
                })
                .collect::<Vec<_>>()
        };

        // Listeners may still `get` the provider while Unregistering is in flight.
        self.deliver(deliveries);
        self.write().providers.remove(&id);
        debug!(provider_id = %id, "Unregistered provider");
        Ok(())
    }
}

/// Stamp the registry-owned properties onto a registration.
fn stamp(mut properties: Properties, interfaces: &[String], id: ProviderId) -> Properties {
    properties.insert(
        keys::OBJECT_CLASS,
        PropertyValue::List(interfaces.iter().cloned().map(PropertyValue::String).collect()),
    );
    properties.insert(keys::SERVICE_ID, id.0);
    properties
}

impl CapabilityRegistry for ServiceRegistry {
    fn subscribe(&self, filter: &Filter, listener: Weak<dyn RegistryListener>) -> SubscriptionId {
        let sid = SubscriptionId(self.inner.subscription_ids.next_value());
        self.inner.write().subscriptions.insert(
            sid,
            Subscription {
                filter: filter.clone(),
                listener,
            },
        );
        debug!(subscription = %sid, filter = %filter, "Subscribed");
        sid
    }

    fn unsubscribe(&self, subscription: SubscriptionId) {
        if self
            .inner
            .write()
            .subscriptions
            .remove(&subscription)
            .is_some()
        {
            debug!(subscription = %subscription, "Unsubscribed");
        }
    }

    fn current_matches(&self, filter: &Filter) -> Vec<ProviderRef> {
        self.inner
            .read()
            .providers
            .values()
            .filter(|e| !e.unregistering && filter.matches(e.reference.properties()))
            .map(|e| e.reference.clone())
            .collect()
    }

    fn register(
        &self,
        interfaces: &[String],
        source: ProviderSource,
        properties: Properties,
    ) -> RegistryResult<Box<dyn Registration>> {
        self.register_provider(interfaces, source, properties)
            .map(|r| Box::new(r) as Box<dyn Registration>)
    }

    fn get(&self, provider: &ProviderRef, consumer: &ConsumerId) -> RegistryResult<ServiceObject> {
        let (source, reference) = {
            let state = self.inner.read();
            let entry = state
                .providers
                .get(&provider.id())
                .ok_or(RegistryError::NotFound(provider.id()))?;
            (entry.source.clone(), entry.reference.clone())
        };
        match source {
            ProviderSource::Object(object) => Ok(object),
            ProviderSource::Factory(factory) => factory
                .get_provider(consumer, &reference)
                .map_err(|e| RegistryError::Factory {
                    provider: provider.id(),
                    message: format!("{e:#}"),
                }),
        }
    }

    fn unget(&self, provider: &ProviderRef, consumer: &ConsumerId) {
        let found = {
            let state = self.inner.read();
            state
                .providers
                .get(&provider.id())
                .map(|e| (e.source.clone(), e.reference.clone()))
        };
        if let Some((ProviderSource::Factory(factory), reference)) = found {
            factory.unget_provider(consumer, &reference);
        }
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.read();
        f.debug_struct("ServiceRegistry")
            .field("provider_count", &state.providers.len())
            .field("subscription_count", &state.subscriptions.len())
            .finish()
    }
}

/// Handle returned by [`ServiceRegistry::register_provider`].
#[derive(Debug)]
pub struct ServiceRegistration {
    registry: Weak<Inner>,
    id: ProviderId,
    reference: RwLock<ProviderRef>,
    unregistered: AtomicBool,
}

impl ServiceRegistration {
    /// The registered provider's id.
    #[must_use]
    pub fn id(&self) -> ProviderId {
        self.id
    }
}

impl Registration for ServiceRegistration {
    fn provider(&self) -> ProviderRef {
        self.reference
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_properties(&self, properties: Properties) -> RegistryResult<()> {
        if self.unregistered.load(Ordering::Acquire) {
            return Err(RegistryError::AlreadyUnregistered(self.id));
        }
        let registry = self
            .registry
            .upgrade()
            .ok_or(RegistryError::NotFound(self.id))?;
        let updated = registry.modify(self.id, properties)?;
        *self
            .reference
            .write()
            .unwrap_or_else(PoisonError::into_inner) = updated;
        Ok(())
    }

    fn unregister(&self) -> RegistryResult<()> {
        if self.unregistered.swap(true, Ordering::AcqRel) {
            return Err(RegistryError::AlreadyUnregistered(self.id));
        }
        let Some(registry) = self.registry.upgrade() else {
            warn!(provider_id = %self.id, "Registry dropped before unregistration");
            return Ok(());
        };
        registry.unregister(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(String, u64)>>,
    }

    impl RegistryListener for Recorder {
        fn registry_changed(&self, event: &RegistryEvent) {
            self.events
                .lock()
                .unwrap()
                .push((event.kind().to_owned(), event.provider().id().0));
        }
    }

    impl Recorder {
        fn take(&self) -> Vec<(String, u64)> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    fn subscribe(registry: &ServiceRegistry, filter: &str) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn RegistryListener> =
            Arc::downgrade(&(Arc::clone(&recorder) as Arc<dyn RegistryListener>));
        registry.subscribe(&Filter::parse(filter).unwrap(), weak);
        recorder
    }

    #[test]
    fn test_register_stamps_identity_properties() {
        let registry = ServiceRegistry::new();
        let reg = registry
            .register_object(&["Greeter"], Arc::new(1_u32), Properties::new())
            .unwrap();
        let provider = reg.provider();
        assert_eq!(provider.interfaces(), vec!["Greeter"]);
        assert_eq!(
            provider.properties().get_i64(keys::SERVICE_ID),
            Some(i64::try_from(reg.id().0).unwrap())
        );
    }

    #[test]
    fn test_events_are_filter_scoped() {
        let registry = ServiceRegistry::new();
        let greeters = subscribe(&registry, "(objectClass=Greeter)");
        let others = subscribe(&registry, "(objectClass=Other)");

        let reg = registry
            .register_object(&["Greeter"], Arc::new(1_u32), Properties::new())
            .unwrap();
        reg.unregister().unwrap();

        let id = reg.id().0;
        assert_eq!(
            greeters.take(),
            vec![("registered".into(), id), ("unregistering".into(), id)]
        );
        assert!(others.take().is_empty());
        assert_eq!(registry.provider_count(), 0);
    }

    #[test]
    fn test_modification_start_and_end_match() {
        let registry = ServiceRegistry::new();
        let eu = subscribe(&registry, "(region=eu)");

        let reg = registry
            .register_object(&["Greeter"], Arc::new(1_u32), Properties::new().with("region", "us"))
            .unwrap();
        reg.set_properties(Properties::new().with("region", "eu")).unwrap();
        reg.set_properties(Properties::new().with("region", "us")).unwrap();

        let id = reg.id().0;
        assert_eq!(
            eu.take(),
            vec![("modified".into(), id), ("modified_end_match".into(), id)]
        );
    }

    #[test]
    fn test_second_unregister_reports_already_unregistered() {
        let registry = ServiceRegistry::new();
        let reg = registry
            .register_object(&["Greeter"], Arc::new(1_u32), Properties::new())
            .unwrap();
        reg.unregister().unwrap();
        assert!(matches!(
            reg.unregister(),
            Err(RegistryError::AlreadyUnregistered(_))
        ));
        assert!(matches!(
            reg.set_properties(Properties::new()),
            Err(RegistryError::AlreadyUnregistered(_))
        ));
    }

    #[test]
    fn test_dropped_listener_is_pruned() {
        let registry = ServiceRegistry::new();
        drop(subscribe(&registry, "(objectClass=Greeter)"));
        assert_eq!(registry.subscription_count(), 1);
        registry
            .register_object(&["Greeter"], Arc::new(1_u32), Properties::new())
            .unwrap();
        assert_eq!(registry.subscription_count(), 0);
    }

    #[test]
    fn test_factory_source_is_called_per_get() {
        struct Counting(Mutex<u32>);
        impl keel_core::ProviderFactory for Counting {
            fn get_provider(
                &self,
                consumer: &ConsumerId,
                _provider: &ProviderRef,
            ) -> anyhow::Result<ServiceObject> {
                let mut n = self.0.lock().unwrap();
                *n = n.saturating_add(1);
                Ok(Arc::new(consumer.as_str().to_owned()))
            }
            fn unget_provider(&self, _consumer: &ConsumerId, _provider: &ProviderRef) {
                let mut n = self.0.lock().unwrap();
                *n = n.saturating_sub(1);
            }
        }

        let registry = ServiceRegistry::new();
        let factory = Arc::new(Counting(Mutex::new(0)));
        let reg = registry
            .register_provider(
                &["Greeter".to_owned()],
                ProviderSource::Factory(Arc::clone(&factory) as Arc<dyn keel_core::ProviderFactory>),
                Properties::new(),
            )
            .unwrap();
        let provider = reg.provider();
        let consumer = ConsumerId::new("alice");
        let object = registry.get(&provider, &consumer).unwrap();
        assert_eq!(object.downcast_ref::<String>().map(String::as_str), Some("alice"));
        assert_eq!(*factory.0.lock().unwrap(), 1);
        registry.unget(&provider, &consumer);
        assert_eq!(*factory.0.lock().unwrap(), 0);
    }

    #[test]
    fn test_current_matches_in_registration_order() {
        let registry = ServiceRegistry::new();
        let a = registry
            .register_object(&["G"], Arc::new(1_u32), Properties::new().with(keys::SERVICE_RANKING, 1))
            .unwrap();
        let b = registry
            .register_object(&["G"], Arc::new(2_u32), Properties::new().with(keys::SERVICE_RANKING, 9))
            .unwrap();
        let ids: Vec<ProviderId> = registry
            .current_matches(&Filter::object_class("G"))
            .iter()
            .map(ProviderRef::id)
            .collect();
        assert_eq!(ids, vec![a.id(), b.id()]);
    }
}
