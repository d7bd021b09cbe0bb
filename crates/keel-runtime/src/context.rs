//! Component contexts: one implementation object and its bound references.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};

use keel_core::{ComponentId, ConsumerId, Properties, PropertyValue, ProviderRef, RecordKey, ServiceObject};

use crate::descriptor::{ComponentDescriptor, Instance};
use crate::error::{ComponentError, ComponentResult};

/// A provider bound into a context, with the object the registry handed out.
#[derive(Clone)]
pub struct BoundProvider {
    provider: ProviderRef,
    object: ServiceObject,
}

impl BoundProvider {
    pub(crate) fn new(provider: ProviderRef, object: ServiceObject) -> Self {
        Self { provider, object }
    }

    /// The provider snapshot at bind time.
    #[must_use]
    pub fn provider(&self) -> &ProviderRef {
        &self.provider
    }

    /// The provider object.
    #[must_use]
    pub fn object(&self) -> &ServiceObject {
        &self.object
    }

    /// The provider object as `T`, if it is one.
    #[must_use]
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.object).downcast::<T>().ok()
    }
}

impl fmt::Debug for BoundProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundProvider")
            .field("provider", &self.provider.id())
            .finish_non_exhaustive()
    }
}

enum Outcome {
    Pending,
    Succeeded(Instance),
    Failed(ComponentError),
}

/// One-shot gate: the first activation resolves it, everyone else waits.
struct ActivationGate {
    outcome: Mutex<Outcome>,
    resolved: Condvar,
    waiters: AtomicUsize,
}

impl ActivationGate {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(Outcome::Pending),
            resolved: Condvar::new(),
            waiters: AtomicUsize::new(0),
        }
    }

    fn wait(&self) -> ComponentResult<Instance> {
        let mut guard = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match &*guard {
                Outcome::Succeeded(instance) => return Ok(Arc::clone(instance)),
                Outcome::Failed(error) => return Err(error.clone()),
                Outcome::Pending => {
                    // Counted while holding the outcome lock.
                    self.waiters.fetch_add(1, Ordering::AcqRel);
                    guard = self
                        .resolved
                        .wait(guard)
                        .unwrap_or_else(PoisonError::into_inner);
                    self.waiters.fetch_sub(1, Ordering::AcqRel);
                },
            }
        }
    }

    fn resolve(&self, outcome: Outcome) {
        let mut guard = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*guard, Outcome::Pending) {
            *guard = outcome;
        }
        drop(guard);
        self.resolved.notify_all();
    }

    fn instance(&self) -> Option<Instance> {
        match &*self.outcome.lock().unwrap_or_else(PoisonError::into_inner) {
            Outcome::Succeeded(instance) => Some(Arc::clone(instance)),
            Outcome::Pending | Outcome::Failed(_) => None,
        }
    }
}

/// What a component's hooks see: its identity, configuration properties
/// and currently bound references.
///
/// A context is activated at most once. Once it is deactivated it is not
/// reused; the next activation for the same consumer creates a new one.
pub struct ComponentContext {
    component_id: ComponentId,
    descriptor: Arc<ComponentDescriptor>,
    consumer: ConsumerId,
    record_key: RecordKey,
    properties: RwLock<Properties>,
    bound: RwLock<Vec<Vec<BoundProvider>>>,
    gate: ActivationGate,
    reusable: AtomicBool,
}

impl ComponentContext {
    pub(crate) fn new(
        component_id: ComponentId,
        descriptor: Arc<ComponentDescriptor>,
        consumer: ConsumerId,
        record_key: RecordKey,
        properties: Properties,
    ) -> Self {
        let slots = descriptor.references().len();
        Self {
            component_id,
            descriptor,
            consumer,
            record_key,
            properties: RwLock::new(properties),
            bound: RwLock::new(vec![Vec::new(); slots]),
            gate: ActivationGate::new(),
            reusable: AtomicBool::new(true),
        }
    }

    /// Id of the owning configuration.
    #[must_use]
    pub fn component_id(&self) -> ComponentId {
        self.component_id
    }

    /// Component name.
    #[must_use]
    pub fn component_name(&self) -> &str {
        self.descriptor.name()
    }

    /// The consumer this context was activated for.
    #[must_use]
    pub fn consumer(&self) -> &ConsumerId {
        &self.consumer
    }

    /// Key of the configuration record in effect.
    #[must_use]
    pub fn record_key(&self) -> &RecordKey {
        &self.record_key
    }

    /// Component properties: descriptor properties overlaid with the
    /// record's properties.
    #[must_use]
    pub fn properties(&self) -> Properties {
        self.properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// One component property.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<PropertyValue> {
        self.properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Providers currently bound to `reference`, best first.
    #[must_use]
    pub fn bound(&self, reference: &str) -> Vec<BoundProvider> {
        let Some(index) = self.reference_index(reference) else {
            return Vec::new();
        };
        self.bound_at(index)
    }

    /// The best provider bound to `reference`, as `T`.
    ///
    /// Provider objects are stored as registered; a provider registered as
    /// `Arc<dyn Trait>` is looked up with `T = Arc<dyn Trait>`.
    #[must_use]
    pub fn service<T: Send + Sync + 'static>(&self, reference: &str) -> Option<Arc<T>> {
        self.bound(reference).first().and_then(BoundProvider::downcast)
    }

    /// Every provider bound to `reference`, as `T`, best first.
    #[must_use]
    pub fn services<T: Send + Sync + 'static>(&self, reference: &str) -> Vec<Arc<T>> {
        self.bound(reference)
            .iter()
            .filter_map(BoundProvider::downcast)
            .collect()
    }

    /// The implementation object, once activation succeeded.
    #[must_use]
    pub fn instance(&self) -> Option<Instance> {
        self.gate.instance()
    }

    fn reference_index(&self, reference: &str) -> Option<usize> {
        self.descriptor
            .references()
            .iter()
            .position(|r| r.name() == reference)
    }

    pub(crate) fn bound_at(&self, index: usize) -> Vec<BoundProvider> {
        self.bound
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn set_bound(&self, index: usize, providers: Vec<BoundProvider>) {
        if let Some(slot) = self
            .bound
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(index)
        {
            *slot = providers;
        }
    }

    pub(crate) fn take_bound(&self, index: usize) -> Vec<BoundProvider> {
        self.bound
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(index)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    pub(crate) fn set_properties(&self, properties: Properties) {
        *self
            .properties
            .write()
            .unwrap_or_else(PoisonError::into_inner) = properties;
    }

    pub(crate) fn wait_activated(&self) -> ComponentResult<Instance> {
        self.gate.wait()
    }

    pub(crate) fn succeed(&self, instance: Instance) {
        self.gate.resolve(Outcome::Succeeded(instance));
    }

    pub(crate) fn fail(&self, error: ComponentError) {
        self.gate.resolve(Outcome::Failed(error));
    }

    /// Threads blocked waiting for this context's first activation.
    pub(crate) fn waiters(&self) -> usize {
        self.gate.waiters.load(Ordering::Acquire)
    }

    pub(crate) fn is_reusable(&self) -> bool {
        self.reusable.load(Ordering::Acquire)
    }

    pub(crate) fn mark_unreusable(&self) {
        self.reusable.store(false, Ordering::Release);
    }
}

impl fmt::Debug for ComponentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentContext")
            .field("component", &self.descriptor.name())
            .field("component_id", &self.component_id)
            .field("consumer", &self.consumer)
            .field("record_key", &self.record_key)
            .field("waiters", &self.waiters())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn context() -> ComponentContext {
        let descriptor = ComponentDescriptor::builder("c", || Ok(()))
            .reference(crate::ReferenceDescriptor::new("log", "Log"))
            .build()
            .unwrap();
        ComponentContext::new(
            ComponentId(1),
            Arc::new(descriptor),
            ConsumerId::runtime(),
            RecordKey::Unconfigured,
            Properties::new().with("k", "v"),
        )
    }

    #[test]
    fn test_gate_releases_every_waiter_with_same_outcome() {
        let ctx = Arc::new(context());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let ctx = Arc::clone(&ctx);
                thread::spawn(move || ctx.wait_activated())
            })
            .collect();
        let instance: Instance = Arc::new(7_u32);
        ctx.succeed(Arc::clone(&instance));
        for waiter in waiters {
            let seen = waiter.join().unwrap().unwrap();
            assert!(Arc::ptr_eq(&seen, &instance));
        }
    }

    #[test]
    fn test_gate_resolves_once() {
        let ctx = context();
        ctx.fail(ComponentError::NotFound("x".into()));
        ctx.succeed(Arc::new(1_u32));
        assert!(ctx.wait_activated().is_err());
        assert!(ctx.instance().is_none());
    }

    #[test]
    fn test_service_lookup_by_reference_name() {
        let ctx = context();
        let provider = ProviderRef::new(keel_core::ProviderId(3), Properties::new());
        ctx.set_bound(0, vec![BoundProvider::new(provider, Arc::new("hello".to_string()))]);

        assert_eq!(ctx.service::<String>("log").as_deref().map(String::as_str), Some("hello"));
        assert!(ctx.service::<u32>("log").is_none());
        assert!(ctx.service::<String>("missing").is_none());
        assert_eq!(ctx.take_bound(0).len(), 1);
        assert!(ctx.bound("log").is_empty());
    }

    #[test]
    fn test_property_lookup() {
        let ctx = context();
        assert_eq!(ctx.property("k").and_then(|v| v.as_str().map(str::to_owned)), Some("v".into()));
        ctx.set_properties(Properties::new());
        assert!(ctx.property("k").is_none());
    }
}
