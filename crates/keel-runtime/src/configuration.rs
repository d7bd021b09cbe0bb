//! Component configurations: the lifecycle state machine for one
//! materialized component.
//!
//! State transitions and the context map are serialized under one mutex,
//! with a condvar for threads waiting on in-flight deactivations. User
//! hooks and registry calls never run with that mutex held.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use keel_core::{
    CapabilityRegistry, ComponentId, ConsumerId, Properties, ProviderFactory, ProviderId,
    ProviderRef, ProviderSource, RecordKey, Registration, RegistryError, ServiceObject, SetDelta,
    keys,
};
use tracing::{debug, error, info, warn};

use crate::context::{BoundProvider, ComponentContext};
use crate::dependency::Dependency;
use crate::descriptor::{ComponentDescriptor, Instance, Instancing};
use crate::error::{ComponentError, ComponentResult};
use crate::state::{ConfigurationState, DeactivationReason};

/// Result of applying a configuration record change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationUpdate {
    /// The configuration took the new properties.
    Updated,
    /// The configuration was disposed; a fresh one is needed.
    Disposed,
}

enum Contexts {
    Shared(Option<Arc<ComponentContext>>),
    PerConsumer(BTreeMap<ConsumerId, Arc<ComponentContext>>),
}

impl Contexts {
    fn new(instancing: Instancing) -> Self {
        match instancing {
            Instancing::Shared => Self::Shared(None),
            Instancing::PerConsumer => Self::PerConsumer(BTreeMap::new()),
        }
    }

    fn get(&self, consumer: &ConsumerId) -> Option<&Arc<ComponentContext>> {
        match self {
            Self::Shared(ctx) => ctx.as_ref(),
            Self::PerConsumer(map) => map.get(consumer),
        }
    }

    fn insert(&mut self, ctx: Arc<ComponentContext>) {
        match self {
            Self::Shared(slot) => *slot = Some(ctx),
            Self::PerConsumer(map) => {
                map.insert(ctx.consumer().clone(), ctx);
            },
        }
    }

    /// Remove `ctx` if it is still the one stored.
    fn remove(&mut self, ctx: &Arc<ComponentContext>) {
        match self {
            Self::Shared(slot) => {
                if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, ctx)) {
                    *slot = None;
                }
            },
            Self::PerConsumer(map) => {
                if map.get(ctx.consumer()).is_some_and(|c| Arc::ptr_eq(c, ctx)) {
                    map.remove(ctx.consumer());
                }
            },
        }
    }

    fn contains(&self, ctx: &Arc<ComponentContext>) -> bool {
        self.get(ctx.consumer()).is_some_and(|c| Arc::ptr_eq(c, ctx))
    }

    fn all(&self) -> Vec<Arc<ComponentContext>> {
        match self {
            Self::Shared(ctx) => ctx.iter().cloned().collect(),
            Self::PerConsumer(map) => map.values().cloned().collect(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Shared(ctx) => usize::from(ctx.is_some()),
            Self::PerConsumer(map) => map.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self) {
        match self {
            Self::Shared(ctx) => *ctx = None,
            Self::PerConsumer(map) => map.clear(),
        }
    }
}

struct ConfigInner {
    state: ConfigurationState,
    properties: Properties,
    registration: Option<Arc<dyn Registration>>,
    contexts: Contexts,
    use_counts: BTreeMap<ConsumerId, usize>,
    disposing: bool,
    deactivations: usize,
}

/// The registered capability's factory: every `get` activates, every
/// `unget` releases.
struct CapabilityFactory {
    configuration: Weak<ComponentConfiguration>,
}

impl ProviderFactory for CapabilityFactory {
    fn get_provider(
        &self,
        consumer: &ConsumerId,
        _provider: &ProviderRef,
    ) -> anyhow::Result<ServiceObject> {
        let configuration = self
            .configuration
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("component configuration is gone"))?;
        Ok(configuration.activate(consumer)?)
    }

    fn unget_provider(&self, consumer: &ConsumerId, _provider: &ProviderRef) {
        if let Some(configuration) = self.configuration.upgrade() {
            configuration.release(consumer);
        }
    }
}

/// One materialized component: a descriptor bound to one configuration
/// record, with its registered capability and live contexts.
pub struct ComponentConfiguration {
    me: Weak<Self>,
    id: ComponentId,
    descriptor: Arc<ComponentDescriptor>,
    key: RecordKey,
    registry: Arc<dyn CapabilityRegistry>,
    dependencies: Arc<[Arc<Dependency>]>,
    deactivation_timeout: Duration,
    inner: Mutex<ConfigInner>,
    changed: Condvar,
}

impl ComponentConfiguration {
    pub(crate) fn new(
        id: ComponentId,
        descriptor: Arc<ComponentDescriptor>,
        key: RecordKey,
        properties: Properties,
        registry: Arc<dyn CapabilityRegistry>,
        dependencies: Arc<[Arc<Dependency>]>,
        deactivation_timeout: Duration,
    ) -> Arc<Self> {
        let contexts = Contexts::new(descriptor.instancing());
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id,
            descriptor,
            key,
            registry,
            dependencies,
            deactivation_timeout,
            inner: Mutex::new(ConfigInner {
                state: ConfigurationState::Activating,
                properties,
                registration: None,
                contexts,
                use_counts: BTreeMap::new(),
                disposing: false,
                deactivations: 0,
            }),
            changed: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ConfigInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn component(&self) -> String {
        self.descriptor.name().to_string()
    }

    fn disposed_error(&self) -> ComponentError {
        ComponentError::Disposed {
            component: self.component(),
            id: self.id.0,
        }
    }

    /// Sequence id.
    #[must_use]
    pub fn id(&self) -> ComponentId {
        self.id
    }

    /// The descriptor this configuration materializes.
    #[must_use]
    pub fn descriptor(&self) -> &Arc<ComponentDescriptor> {
        &self.descriptor
    }

    /// Key of the configuration record in effect.
    #[must_use]
    pub fn record_key(&self) -> &RecordKey {
        &self.key
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConfigurationState {
        self.lock().state
    }

    /// The configuration record's properties.
    #[must_use]
    pub fn record_properties(&self) -> Properties {
        self.lock().properties.clone()
    }

    /// Number of live contexts.
    #[must_use]
    pub fn context_count(&self) -> usize {
        self.lock().contexts.len()
    }

    /// Live contexts.
    #[must_use]
    pub fn contexts(&self) -> Vec<Arc<ComponentContext>> {
        self.lock().contexts.all()
    }

    /// How many times `consumer` holds the instance.
    #[must_use]
    pub fn use_count(&self, consumer: &ConsumerId) -> usize {
        self.lock().use_counts.get(consumer).copied().unwrap_or(0)
    }

    /// The registered capability, while registered.
    #[must_use]
    pub fn registered_provider(&self) -> Option<ProviderRef> {
        let registration = self.lock().registration.clone();
        registration.map(|r| r.provider())
    }

    /// Properties the capability is registered with.
    #[must_use]
    pub fn registered_properties(&self) -> Properties {
        let record = self.lock().properties.clone();
        self.registered_properties_for(&record)
    }

    fn registered_properties_for(&self, record: &Properties) -> Properties {
        let mut properties = self.descriptor.properties().merged(&record.public());
        properties.insert(keys::COMPONENT_NAME, self.descriptor.name());
        properties.insert(keys::COMPONENT_ID, self.id.0);
        match self.key.as_pid() {
            Some(pid) => {
                properties.insert(keys::SERVICE_PID, pid);
            },
            None => {
                properties.remove(keys::SERVICE_PID);
            },
        }
        properties
    }

    fn context_properties(&self, record: &Properties) -> Properties {
        let mut properties = self.descriptor.properties().merged(record);
        properties.insert(keys::COMPONENT_NAME, self.descriptor.name());
        properties.insert(keys::COMPONENT_ID, self.id.0);
        properties
    }

    /// Block until the configuration reaches `Deactive`, up to `timeout`.
    /// Returns whether it did.
    #[must_use]
    pub fn wait_disposed(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |inner| !inner.state.is_terminal())
            .unwrap_or_else(PoisonError::into_inner);
        guard.state.is_terminal()
    }

    /// Register the provided capability, or activate immediately for the
    /// runtime if the component provides nothing.
    pub(crate) fn start(&self) -> ComponentResult<()> {
        if !self.descriptor.provides_capability() {
            self.activate(&ConsumerId::runtime())?;
            return Ok(());
        }

        let factory: Arc<dyn ProviderFactory> = Arc::new(CapabilityFactory {
            configuration: self.me.clone(),
        });
        let registration: Arc<dyn Registration> = Arc::from(self.registry.register(
            self.descriptor.provides(),
            ProviderSource::Factory(factory),
            self.registered_properties(),
        )?);
        let provider_id = registration.provider().id();

        let mut inner = self.lock();
        if inner.disposing {
            drop(inner);
            self.unregister(registration.as_ref());
            return Err(self.disposed_error());
        }
        inner.registration = Some(registration);
        if inner.state == ConfigurationState::Activating {
            inner.state = ConfigurationState::Registered;
        }
        drop(inner);
        self.changed.notify_all();

        info!(
            component = %self.descriptor.name(),
            component_id = %self.id,
            provider_id = %provider_id,
            "registered component capability"
        );
        Ok(())
    }

    /// Activate for `consumer`, creating the instance on first use.
    ///
    /// Concurrent first activations for the same context collapse onto one
    /// instantiation; every caller sees the same outcome.
    ///
    /// # Errors
    ///
    /// [`ComponentError::DeactivationTimeout`] if an in-progress
    /// deactivation outlasts the configured bound,
    /// [`ComponentError::Disposed`] after disposal, or
    /// [`ComponentError::ActivationFailed`] wrapping an instantiation,
    /// binding or hook failure.
    pub fn activate(&self, consumer: &ConsumerId) -> ComponentResult<Instance> {
        self.activate_for(consumer, true)
    }

    fn activate_for(&self, consumer: &ConsumerId, count_use: bool) -> ComponentResult<Instance> {
        let (ctx, fresh) = {
            let mut inner = self.wait_for_deactivations()?;
            if inner.disposing || inner.state.is_terminal() {
                return Err(self.disposed_error());
            }
            match inner.contexts.get(consumer) {
                Some(ctx) if ctx.is_reusable() => (Arc::clone(ctx), false),
                _ => {
                    let properties = self.context_properties(&inner.properties);
                    let ctx = Arc::new(ComponentContext::new(
                        self.id,
                        Arc::clone(&self.descriptor),
                        consumer.clone(),
                        self.key.clone(),
                        properties,
                    ));
                    inner.contexts.insert(Arc::clone(&ctx));
                    (ctx, true)
                },
            }
        };

        let outcome = if fresh {
            self.construct(&ctx)
        } else {
            ctx.wait_activated()
        };

        let mut inner = self.lock();
        match outcome {
            Ok(instance) => {
                if inner.disposing || !inner.contexts.contains(&ctx) {
                    return Err(self.disposed_error());
                }
                if fresh {
                    inner.state = ConfigurationState::Active;
                }
                if count_use {
                    let count = inner.use_counts.entry(consumer.clone()).or_insert(0);
                    *count = count.saturating_add(1);
                }
                Ok(instance)
            },
            Err(e) => {
                if fresh {
                    inner.contexts.remove(&ctx);
                }
                Err(e)
            },
        }
    }

    fn wait_for_deactivations(&self) -> ComponentResult<MutexGuard<'_, ConfigInner>> {
        let guard = self.lock();
        let (guard, wait) = self
            .changed
            .wait_timeout_while(guard, self.deactivation_timeout, |inner| {
                inner.deactivations > 0 || inner.state == ConfigurationState::Deactivating
            })
            .unwrap_or_else(PoisonError::into_inner);
        if wait.timed_out() {
            let timeout_ms = u64::try_from(self.deactivation_timeout.as_millis()).unwrap_or(u64::MAX);
            warn!(
                component = %self.descriptor.name(),
                component_id = %self.id,
                timeout_ms,
                "activation timed out waiting for deactivation"
            );
            return Err(ComponentError::DeactivationTimeout {
                component: self.component(),
                timeout_ms,
            });
        }
        Ok(guard)
    }

    fn construct(&self, ctx: &Arc<ComponentContext>) -> ComponentResult<Instance> {
        match self.instantiate(ctx) {
            Ok(instance) => {
                ctx.succeed(Arc::clone(&instance));
                debug!(
                    component = %self.descriptor.name(),
                    component_id = %self.id,
                    consumer = %ctx.consumer(),
                    "component activated"
                );
                Ok(instance)
            },
            Err(cause) => {
                let error = ComponentError::ActivationFailed {
                    component: self.component(),
                    source: Box::new(cause),
                };
                warn!(
                    component = %self.descriptor.name(),
                    component_id = %self.id,
                    error = %error,
                    "component activation failed"
                );
                ctx.fail(error.clone());
                Err(error)
            },
        }
    }

    fn instantiate(&self, ctx: &ComponentContext) -> ComponentResult<Instance> {
        let instance =
            self.descriptor
                .new_instance()
                .map_err(|e| ComponentError::Instantiation {
                    component: self.component(),
                    message: format!("{e:#}"),
                })?;

        for index in 0..self.dependencies.len() {
            if let Err(e) = self.bind(index, &instance, ctx) {
                self.unbind_from(index, &instance, ctx);
                return Err(e);
            }
        }

        if let Some(hook) = self.descriptor.activate_hook().present()
            && let Err(e) = hook(&instance, ctx)
        {
            self.unbind_from(self.dependencies.len().saturating_sub(1), &instance, ctx);
            return Err(self.hook_error("activate", &e));
        }
        Ok(instance)
    }

    fn hook_error(&self, hook: &str, error: &anyhow::Error) -> ComponentError {
        ComponentError::Hook {
            component: self.component(),
            hook: hook.to_string(),
            message: format!("{error:#}"),
        }
    }

    fn registry_consumer(&self) -> ConsumerId {
        ConsumerId::component(self.id)
    }

    fn bind(&self, index: usize, instance: &Instance, ctx: &ComponentContext) -> ComponentResult<()> {
        let Some(dependency) = self.dependencies.get(index) else {
            return Ok(());
        };
        let reference = dependency.reference();
        let providers = dependency.providers_for(ctx.record_key());
        let candidates: Vec<ProviderRef> = if reference.is_multiple() {
            providers.to_vec()
        } else {
            providers.best().cloned().into_iter().collect()
        };

        let consumer = self.registry_consumer();
        let mut bound = Vec::with_capacity(candidates.len());
        for provider in candidates {
            match self.registry.get(&provider, &consumer) {
                Ok(object) => bound.push(BoundProvider::new(provider, object)),
                Err(e) => warn!(
                    component = %self.descriptor.name(),
                    reference = reference.name(),
                    provider_id = %provider.id(),
                    error = %e,
                    "could not obtain provider"
                ),
            }
        }
        if bound.is_empty() && !reference.is_optional() {
            return Err(ComponentError::UnsatisfiedReference {
                component: self.component(),
                reference: reference.name().to_string(),
            });
        }

        ctx.set_bound(index, bound.clone());
        if let Some(hook) = reference.bind_hook().present() {
            for provider in &bound {
                hook(instance, ctx, provider)
                    .map_err(|e| self.hook_error(&format!("bind:{}", reference.name()), &e))?;
            }
        }
        Ok(())
    }

    /// Unbind references `last..=0`, in reverse declaration order.
    fn unbind_from(&self, last: usize, instance: &Instance, ctx: &ComponentContext) {
        if self.dependencies.is_empty() {
            return;
        }
        for index in (0..=last).rev() {
            self.unbind(index, instance, ctx);
        }
    }

    fn unbind(&self, index: usize, instance: &Instance, ctx: &ComponentContext) {
        let Some(dependency) = self.dependencies.get(index) else {
            return;
        };
        let reference = dependency.reference();
        let consumer = self.registry_consumer();
        for provider in ctx.take_bound(index).iter().rev() {
            self.call_unbind_hook(index, instance, ctx, provider);
            self.registry.unget(provider.provider(), &consumer);
        }
        debug!(
            component = %self.descriptor.name(),
            reference = reference.name(),
            "reference unbound"
        );
    }

    fn call_unbind_hook(
        &self,
        index: usize,
        instance: &Instance,
        ctx: &ComponentContext,
        provider: &BoundProvider,
    ) {
        let Some(reference) = self.descriptor.references().get(index) else {
            return;
        };
        if let Some(hook) = reference.unbind_hook().present()
            && let Err(e) = hook(instance, ctx, provider)
        {
            error!(
                component = %self.descriptor.name(),
                reference = reference.name(),
                provider_id = %provider.provider().id(),
                error = %format!("{e:#}"),
                "unbind hook failed"
            );
        }
    }

    /// Run the deactivate hook and unbind every reference.
    fn teardown(&self, ctx: &ComponentContext, reason: DeactivationReason) {
        let Ok(instance) = ctx.wait_activated() else {
            return;
        };
        if let Some(hook) = self.descriptor.deactivate_hook().present()
            && let Err(e) = hook(&instance, ctx, reason)
        {
            error!(
                component = %self.descriptor.name(),
                component_id = %self.id,
                reason = %reason,
                error = %format!("{e:#}"),
                "deactivate hook failed"
            );
        }
        self.unbind_from(self.dependencies.len().saturating_sub(1), &instance, ctx);
        debug!(
            component = %self.descriptor.name(),
            component_id = %self.id,
            consumer = %ctx.consumer(),
            reason = %reason,
            "component deactivated"
        );
    }

    fn unregister(&self, registration: &dyn Registration) {
        match registration.unregister() {
            Ok(()) => debug!(
                component = %self.descriptor.name(),
                component_id = %self.id,
                "unregistered component capability"
            ),
            Err(RegistryError::AlreadyUnregistered(_)) => debug!(
                component = %self.descriptor.name(),
                component_id = %self.id,
                "capability already unregistered"
            ),
            Err(e) => warn!(
                component = %self.descriptor.name(),
                component_id = %self.id,
                error = %e,
                "failed to unregister component capability"
            ),
        }
    }

    /// Deactivate one context.
    ///
    /// With `dispose_if_last`, deactivating the last live context disposes
    /// the whole configuration. Otherwise the configuration falls back to
    /// `Registered` (or `Activating` without a capability) once no context
    /// remains.
    pub fn deactivate(
        &self,
        ctx: &Arc<ComponentContext>,
        reason: DeactivationReason,
        dispose_if_last: bool,
    ) {
        {
            let mut inner = self.lock();
            if inner.disposing || !inner.contexts.contains(ctx) {
                return;
            }
            if dispose_if_last && inner.contexts.len() == 1 {
                drop(inner);
                self.dispose(reason);
                return;
            }
            ctx.mark_unreusable();
            inner.deactivations = inner.deactivations.saturating_add(1);
        }

        self.teardown(ctx, reason);

        let mut inner = self.lock();
        inner.contexts.remove(ctx);
        inner.deactivations = inner.deactivations.saturating_sub(1);
        if !inner.disposing && inner.contexts.is_empty() {
            inner.state = if inner.registration.is_some() {
                ConfigurationState::Registered
            } else {
                ConfigurationState::Activating
            };
        }
        drop(inner);
        self.changed.notify_all();
    }

    /// Dispose the configuration: unregister the capability and deactivate
    /// every live context. Idempotent; a concurrent second call returns
    /// immediately and the caller can [`wait_disposed`](Self::wait_disposed).
    pub fn dispose(&self, reason: DeactivationReason) {
        let (contexts, registration) = {
            let mut inner = self.lock();
            if inner.disposing {
                return;
            }
            inner.disposing = true;
            inner.state = ConfigurationState::Deactivating;
            inner.use_counts.clear();
            let contexts = inner.contexts.all();
            for ctx in &contexts {
                ctx.mark_unreusable();
            }
            (contexts, inner.registration.take())
        };
        debug!(
            component = %self.descriptor.name(),
            component_id = %self.id,
            reason = %reason,
            contexts = contexts.len(),
            "disposing component configuration"
        );

        if let Some(registration) = registration {
            self.unregister(registration.as_ref());
        }
        for ctx in &contexts {
            self.teardown(ctx, reason);
        }

        let mut inner = self.lock();
        inner.contexts.clear();
        inner.state = ConfigurationState::Deactive;
        drop(inner);
        self.changed.notify_all();
        info!(
            component = %self.descriptor.name(),
            component_id = %self.id,
            reason = %reason,
            "component configuration disposed"
        );
    }

    /// `consumer` released one use. At zero its context is deactivated
    /// without disposing the configuration.
    pub fn release(&self, consumer: &ConsumerId) {
        let ctx = {
            let mut inner = self.lock();
            let Some(count) = inner.use_counts.get_mut(consumer) else {
                return;
            };
            *count = count.saturating_sub(1);
            if *count > 0 {
                return;
            }
            inner.use_counts.remove(consumer);
            match &inner.contexts {
                Contexts::Shared(ctx) if inner.use_counts.is_empty() => ctx.clone(),
                Contexts::Shared(_) => None,
                Contexts::PerConsumer(map) => map.get(consumer).cloned(),
            }
        };
        if let Some(ctx) = ctx {
            self.deactivate(&ctx, DeactivationReason::Released, false);
        }
    }

    /// Apply a record change: `None` means the record was deleted.
    ///
    /// Without a modified hook any change of a live configuration disposes
    /// it. With one, the hook runs on every live context and the registered
    /// capability's properties are refreshed.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::Hook`] if the modified hook fails.
    pub fn configuration_changed(
        &self,
        record: Option<Properties>,
    ) -> ComponentResult<ConfigurationUpdate> {
        let Some(record) = record else {
            self.dispose(DeactivationReason::ConfigurationDeleted);
            return Ok(ConfigurationUpdate::Disposed);
        };

        let (active, contexts, registration) = {
            let mut inner = self.lock();
            if inner.disposing {
                return Ok(ConfigurationUpdate::Disposed);
            }
            inner.properties = record.clone();
            (
                inner.state == ConfigurationState::Active,
                inner.contexts.all(),
                inner.registration.clone(),
            )
        };

        if active {
            let Some(hook) = self.descriptor.modified_hook().present() else {
                self.dispose(DeactivationReason::ConfigurationModified);
                return Ok(ConfigurationUpdate::Disposed);
            };
            let properties = self.context_properties(&record);
            for ctx in &contexts {
                ctx.set_properties(properties.clone());
                if let Some(instance) = ctx.instance() {
                    hook(&instance, ctx, &record).map_err(|e| self.hook_error("modified", &e))?;
                }
            }
        }

        if let Some(registration) = registration {
            match registration.set_properties(self.registered_properties_for(&record)) {
                Ok(()) | Err(RegistryError::AlreadyUnregistered(_)) => {},
                Err(e) => warn!(
                    component = %self.descriptor.name(),
                    component_id = %self.id,
                    error = %e,
                    "failed to refresh registered properties"
                ),
            }
        }
        debug!(
            component = %self.descriptor.name(),
            component_id = %self.id,
            "configuration updated"
        );
        Ok(ConfigurationUpdate::Updated)
    }

    /// React to a change in the providers of reference `index`.
    ///
    /// Dynamic references rebind live contexts in place, binding new
    /// providers before unbinding departed ones. Static references put each
    /// context whose bound set changed through one deactivate/activate
    /// cycle.
    pub(crate) fn reference_changed(&self, index: usize, delta: &SetDelta) {
        let Some(dependency) = self.dependencies.get(index) else {
            return;
        };
        let reference = dependency.reference();
        let contexts = {
            let inner = self.lock();
            if inner.disposing {
                return;
            }
            inner.contexts.all()
        };
        debug!(
            component = %self.descriptor.name(),
            component_id = %self.id,
            reference = reference.name(),
            added = delta.added.len(),
            modified = delta.modified.len(),
            removed = delta.removed.len(),
            "reference providers changed"
        );

        for ctx in contexts {
            let Some(instance) = ctx.instance() else {
                continue;
            };
            let desired = self.desired(index, &ctx);
            let bound = ctx.bound_at(index);
            let bound_ids: BTreeSet<ProviderId> = bound.iter().map(|b| b.provider().id()).collect();
            let desired_ids: BTreeSet<ProviderId> = desired.iter().map(ProviderRef::id).collect();

            if reference.is_dynamic() {
                self.rebind(index, &instance, &ctx, &desired, bound);
            } else if bound_ids != desired_ids {
                let consumer = ctx.consumer().clone();
                self.deactivate(&ctx, DeactivationReason::ReferenceRebind, false);
                if let Err(e) = self.activate_for(&consumer, false) {
                    error!(
                        component = %self.descriptor.name(),
                        component_id = %self.id,
                        reference = reference.name(),
                        error = %e,
                        "reactivation after static rebind failed"
                    );
                }
            }
        }
    }

    /// Providers reference `index` should be bound to for `ctx`.
    fn desired(&self, index: usize, ctx: &ComponentContext) -> Vec<ProviderRef> {
        let Some(dependency) = self.dependencies.get(index) else {
            return Vec::new();
        };
        let providers = dependency.providers_for(ctx.record_key());
        if dependency.reference().is_multiple() {
            providers.to_vec()
        } else {
            providers.best().cloned().into_iter().collect()
        }
    }

    fn rebind(
        &self,
        index: usize,
        instance: &Instance,
        ctx: &ComponentContext,
        desired: &[ProviderRef],
        bound: Vec<BoundProvider>,
    ) {
        let Some(reference) = self.descriptor.references().get(index) else {
            return;
        };
        let consumer = self.registry_consumer();
        let departing: Vec<BoundProvider> = bound
            .iter()
            .rev()
            .filter(|b| !desired.iter().any(|p| p.id() == b.provider().id()))
            .cloned()
            .collect();
        let mut current: BTreeMap<ProviderId, BoundProvider> =
            bound.into_iter().map(|b| (b.provider().id(), b)).collect();

        for provider in desired {
            if current.contains_key(&provider.id()) {
                continue;
            }
            let object = match self.registry.get(provider, &consumer) {
                Ok(object) => object,
                Err(e) => {
                    warn!(
                        component = %self.descriptor.name(),
                        reference = reference.name(),
                        provider_id = %provider.id(),
                        error = %e,
                        "could not obtain provider for rebind"
                    );
                    continue;
                },
            };
            let added = BoundProvider::new(provider.clone(), object);
            current.insert(provider.id(), added.clone());
            ctx.set_bound(index, visible(&current, desired));
            if let Some(hook) = reference.bind_hook().present()
                && let Err(e) = hook(instance, ctx, &added)
            {
                error!(
                    component = %self.descriptor.name(),
                    reference = reference.name(),
                    provider_id = %provider.id(),
                    error = %format!("{e:#}"),
                    "bind hook failed"
                );
            }
        }

        for provider in departing {
            current.remove(&provider.provider().id());
            ctx.set_bound(index, visible(&current, desired));
            self.call_unbind_hook(index, instance, ctx, &provider);
            self.registry.unget(provider.provider(), &consumer);
        }
        ctx.set_bound(index, visible(&current, desired));
    }
}

/// Bound providers in rank order with fresh snapshots, followed by those
/// about to be unbound.
fn visible(
    current: &BTreeMap<ProviderId, BoundProvider>,
    desired: &[ProviderRef],
) -> Vec<BoundProvider> {
    let mut out: Vec<BoundProvider> = desired
        .iter()
        .filter_map(|p| {
            current
                .get(&p.id())
                .map(|b| BoundProvider::new(p.clone(), Arc::clone(b.object())))
        })
        .collect();
    out.extend(
        current
            .values()
            .filter(|b| !desired.iter().any(|p| p.id() == b.provider().id()))
            .cloned(),
    );
    out
}

impl fmt::Debug for ComponentConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("ComponentConfiguration")
            .field("id", &self.id)
            .field("component", &self.descriptor.name())
            .field("key", &self.key)
            .field("state", &inner.state)
            .field("contexts", &inner.contexts.len())
            .finish_non_exhaustive()
    }
}
