//! Component descriptors: the static metadata of a component type.
//!
//! A descriptor is built once, validated when it is added to the runtime,
//! and never changes afterwards. Hooks are stored type-erased; the typed
//! [`ComponentBuilder`] wraps closures over the concrete implementation type
//! so user code never downcasts by hand.

use std::any::type_name;
use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::anyhow;

use keel_core::{Filter, Properties, PropertyValue, RankingRule, ServiceObject, keys};

use crate::context::{BoundProvider, ComponentContext};
use crate::error::{ComponentError, ComponentResult};
use crate::state::DeactivationReason;

/// A live implementation object.
pub type Instance = ServiceObject;

/// Activate hook.
pub type ActivateHook = dyn Fn(&Instance, &ComponentContext) -> anyhow::Result<()> + Send + Sync;
/// Deactivate hook.
pub type DeactivateHook =
    dyn Fn(&Instance, &ComponentContext, DeactivationReason) -> anyhow::Result<()> + Send + Sync;
/// Modified hook, called with the new record properties.
pub type ModifiedHook =
    dyn Fn(&Instance, &ComponentContext, &Properties) -> anyhow::Result<()> + Send + Sync;
/// Per-reference bind/unbind hook.
pub type BindHook =
    dyn Fn(&Instance, &ComponentContext, &BoundProvider) -> anyhow::Result<()> + Send + Sync;

/// Creates implementation objects.
pub trait InstanceFactory: Send + Sync {
    /// Create a new implementation object for `descriptor`.
    ///
    /// # Errors
    ///
    /// Any error fails the activation that asked for the instance.
    fn new_instance(&self, descriptor: &ComponentDescriptor) -> anyhow::Result<Instance>;
}

impl<F> InstanceFactory for F
where
    F: Fn(&ComponentDescriptor) -> anyhow::Result<Instance> + Send + Sync,
{
    fn new_instance(&self, descriptor: &ComponentDescriptor) -> anyhow::Result<Instance> {
        self(descriptor)
    }
}

/// An optional lifecycle hook.
pub enum Hook<F: ?Sized> {
    /// The component declares no such hook.
    Missing,
    /// The hook to call.
    Present(Arc<F>),
}

impl<F: ?Sized> Hook<F> {
    /// Whether a hook is declared.
    #[must_use]
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }

    /// The hook, if declared.
    #[must_use]
    pub fn present(&self) -> Option<&Arc<F>> {
        match self {
            Self::Missing => None,
            Self::Present(f) => Some(f),
        }
    }
}

impl<F: ?Sized> Clone for Hook<F> {
    fn clone(&self) -> Self {
        match self {
            Self::Missing => Self::Missing,
            Self::Present(f) => Self::Present(Arc::clone(f)),
        }
    }
}

impl<F: ?Sized> Default for Hook<F> {
    fn default() -> Self {
        Self::Missing
    }
}

impl<F: ?Sized> fmt::Debug for Hook<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Missing => "Hook::Missing",
            Self::Present(_) => "Hook::Present",
        })
    }
}

/// Whether consumers share one instance or each get their own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Instancing {
    /// One instance shared by every consumer.
    #[default]
    Shared,
    /// One instance per requesting consumer.
    PerConsumer,
}

/// How configuration records decide which configurations exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigurationPolicy {
    /// Records are ignored; exactly one unconfigured configuration.
    Ignore,
    /// One configuration per record, or one unconfigured configuration
    /// when there are no records.
    #[default]
    Optional,
    /// One configuration per record; none without records.
    Require,
}

/// How many providers a reference needs and binds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Cardinality {
    /// `0..1`
    Optional,
    /// `1..1`
    #[default]
    Mandatory,
    /// `0..n`
    Multiple,
    /// `1..n`
    AtLeastOne,
}

impl Cardinality {
    /// Whether the reference may be unbound.
    #[must_use]
    pub fn is_optional(self) -> bool {
        matches!(self, Self::Optional | Self::Multiple)
    }

    /// Whether every matching provider is bound.
    #[must_use]
    pub fn is_multiple(self) -> bool {
        matches!(self, Self::Multiple | Self::AtLeastOne)
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Optional => "0..1",
            Self::Mandatory => "1..1",
            Self::Multiple => "0..n",
            Self::AtLeastOne => "1..n",
        })
    }
}

/// What happens to live instances when bound providers change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReferencePolicy {
    /// Deactivate and reactivate the instance.
    #[default]
    Static,
    /// Rebind in place through the bind/unbind hooks.
    Dynamic,
}

/// One declared dependency of a component.
#[derive(Debug, Clone)]
pub struct ReferenceDescriptor {
    name: String,
    interface: String,
    target: Option<Filter>,
    cardinality: Cardinality,
    policy: ReferencePolicy,
    bind: Hook<BindHook>,
    unbind: Hook<BindHook>,
}

impl ReferenceDescriptor {
    /// A mandatory, static reference to providers of `interface`.
    #[must_use]
    pub fn new(name: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interface: interface.into(),
            target: None,
            cardinality: Cardinality::default(),
            policy: ReferencePolicy::default(),
            bind: Hook::Missing,
            unbind: Hook::Missing,
        }
    }

    /// Set the cardinality.
    #[must_use]
    pub fn cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    /// Set the rebind policy.
    #[must_use]
    pub fn policy(mut self, policy: ReferencePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Shorthand for [`ReferencePolicy::Dynamic`].
    #[must_use]
    pub fn dynamic(self) -> Self {
        self.policy(ReferencePolicy::Dynamic)
    }

    /// Narrow the matched providers with a target filter.
    #[must_use]
    pub fn target(mut self, target: Filter) -> Self {
        self.target = Some(target);
        self
    }

    /// Reference name, unique within the component.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Referenced interface.
    #[must_use]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Declared cardinality.
    #[must_use]
    pub fn cardinality_value(&self) -> Cardinality {
        self.cardinality
    }

    /// Whether the reference may stay unbound.
    #[must_use]
    pub fn is_optional(&self) -> bool {
        self.cardinality.is_optional()
    }

    /// Whether all matching providers are bound.
    #[must_use]
    pub fn is_multiple(&self) -> bool {
        self.cardinality.is_multiple()
    }

    /// Whether changes rebind in place.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.policy == ReferencePolicy::Dynamic
    }

    /// `(objectClass=<interface>)` intersected with the declared target.
    #[must_use]
    pub fn base_filter(&self) -> Filter {
        let class = Filter::object_class(&self.interface);
        match &self.target {
            Some(target) => class.and(target),
            None => class,
        }
    }

    /// The record property that overrides this reference's target.
    #[must_use]
    pub fn target_property(&self) -> String {
        format!("{}{}", self.name, keys::TARGET_SUFFIX)
    }

    pub(crate) fn bind_hook(&self) -> &Hook<BindHook> {
        &self.bind
    }

    pub(crate) fn unbind_hook(&self) -> &Hook<BindHook> {
        &self.unbind
    }
}

/// Static metadata of one component type.
pub struct ComponentDescriptor {
    name: String,
    pid: String,
    factory: Arc<dyn InstanceFactory>,
    references: Vec<ReferenceDescriptor>,
    provides: Vec<String>,
    instancing: Instancing,
    configuration_policy: ConfigurationPolicy,
    properties: Properties,
    ranking_rule: RankingRule,
    activate: Hook<ActivateHook>,
    deactivate: Hook<DeactivateHook>,
    modified: Hook<ModifiedHook>,
}

impl ComponentDescriptor {
    /// Start building a descriptor for implementation type `T`.
    pub fn builder<T, F>(name: impl Into<String>, factory: F) -> ComponentBuilder<T>
    where
        T: Send + Sync + 'static,
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        ComponentBuilder::new(name, factory)
    }

    /// Component name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration pid; defaults to the name.
    #[must_use]
    pub fn pid(&self) -> &str {
        &self.pid
    }

    /// Declared references, in binding order.
    #[must_use]
    pub fn references(&self) -> &[ReferenceDescriptor] {
        &self.references
    }

    /// Look up a reference by name.
    #[must_use]
    pub fn reference(&self, name: &str) -> Option<&ReferenceDescriptor> {
        self.references.iter().find(|r| r.name == name)
    }

    /// Provided interfaces.
    #[must_use]
    pub fn provides(&self) -> &[String] {
        &self.provides
    }

    /// Whether the component registers a capability.
    #[must_use]
    pub fn provides_capability(&self) -> bool {
        !self.provides.is_empty()
    }

    /// Instancing mode.
    #[must_use]
    pub fn instancing(&self) -> Instancing {
        self.instancing
    }

    /// Configuration policy.
    #[must_use]
    pub fn configuration_policy(&self) -> ConfigurationPolicy {
        self.configuration_policy
    }

    /// Static component properties.
    #[must_use]
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Rule used to pick providers for this component's references.
    #[must_use]
    pub fn ranking_rule(&self) -> RankingRule {
        self.ranking_rule
    }

    /// Whether a modified hook is declared.
    #[must_use]
    pub fn has_modified_hook(&self) -> bool {
        self.modified.is_present()
    }

    pub(crate) fn new_instance(&self) -> anyhow::Result<Instance> {
        self.factory.new_instance(self)
    }

    pub(crate) fn activate_hook(&self) -> &Hook<ActivateHook> {
        &self.activate
    }

    pub(crate) fn deactivate_hook(&self) -> &Hook<DeactivateHook> {
        &self.deactivate
    }

    pub(crate) fn modified_hook(&self) -> &Hook<ModifiedHook> {
        &self.modified
    }

    /// Reject descriptors the runtime cannot manage.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::InvalidDescriptor`] for an empty name, an
    /// empty pid, empty or duplicate reference names, an empty interface,
    /// or per-consumer instancing without a provided capability.
    pub fn validate(&self) -> ComponentResult<()> {
        if self.name.trim().is_empty() {
            return Err(invalid("component name must not be empty"));
        }
        if self.pid.trim().is_empty() {
            return Err(invalid(format!("{}: configuration pid must not be empty", self.name)));
        }
        let mut seen = BTreeSet::new();
        for reference in &self.references {
            if reference.name.trim().is_empty() {
                return Err(invalid(format!("{}: reference name must not be empty", self.name)));
            }
            if reference.interface.trim().is_empty() {
                return Err(invalid(format!(
                    "{}: reference '{}' has no interface",
                    self.name, reference.name
                )));
            }
            if !seen.insert(reference.name.as_str()) {
                return Err(invalid(format!(
                    "{}: duplicate reference name '{}'",
                    self.name, reference.name
                )));
            }
        }
        if self.provides.iter().any(|p| p.trim().is_empty()) {
            return Err(invalid(format!("{}: provided interface must not be empty", self.name)));
        }
        if self.instancing == Instancing::PerConsumer && self.provides.is_empty() {
            return Err(invalid(format!(
                "{}: per-consumer instancing requires a provided interface",
                self.name
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for ComponentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentDescriptor")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("references", &self.references)
            .field("provides", &self.provides)
            .field("instancing", &self.instancing)
            .field("configuration_policy", &self.configuration_policy)
            .field("activate", &self.activate)
            .field("deactivate", &self.deactivate)
            .field("modified", &self.modified)
            .finish_non_exhaustive()
    }
}

fn invalid(message: impl Into<String>) -> ComponentError {
    ComponentError::InvalidDescriptor(message.into())
}

fn downcast<T: 'static>(instance: &Instance) -> anyhow::Result<&T> {
    instance
        .downcast_ref::<T>()
        .ok_or_else(|| anyhow!("instance is not a {}", type_name::<T>()))
}

/// Typed builder for [`ComponentDescriptor`].
///
/// ```rust
/// use keel_runtime::{ComponentDescriptor, ReferenceDescriptor};
///
/// struct Greeter;
///
/// let descriptor = ComponentDescriptor::builder("greeter", || Ok(Greeter))
///     .provides("Greeter")
///     .reference(ReferenceDescriptor::new("log", "Log").dynamic())
///     .on_activate(|_greeter: &Greeter, ctx| {
///         tracing::info!(component = ctx.component_name(), "activated");
///         Ok(())
///     })
///     .build()
///     .unwrap();
/// assert_eq!(descriptor.references().len(), 1);
/// ```
pub struct ComponentBuilder<T> {
    name: String,
    pid: Option<String>,
    factory: Arc<dyn InstanceFactory>,
    references: Vec<ReferenceDescriptor>,
    provides: Vec<String>,
    instancing: Instancing,
    configuration_policy: ConfigurationPolicy,
    properties: Properties,
    ranking_rule: RankingRule,
    activate: Hook<ActivateHook>,
    deactivate: Hook<DeactivateHook>,
    modified: Hook<ModifiedHook>,
    errors: Vec<String>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> ComponentBuilder<T> {
    /// Start a builder; `factory` creates the implementation object.
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let factory: Arc<dyn InstanceFactory> =
            Arc::new(move |_: &ComponentDescriptor| -> anyhow::Result<Instance> {
                Ok(Arc::new(factory()?))
            });
        Self {
            name: name.into(),
            pid: None,
            factory,
            references: Vec::new(),
            provides: Vec::new(),
            instancing: Instancing::default(),
            configuration_policy: ConfigurationPolicy::default(),
            properties: Properties::new(),
            ranking_rule: RankingRule::default(),
            activate: Hook::Missing,
            deactivate: Hook::Missing,
            modified: Hook::Missing,
            errors: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Add a provided interface.
    #[must_use]
    pub fn provides(mut self, interface: impl Into<String>) -> Self {
        self.provides.push(interface.into());
        self
    }

    /// Add a reference. References bind in the order they are added.
    #[must_use]
    pub fn reference(mut self, reference: ReferenceDescriptor) -> Self {
        self.references.push(reference);
        self
    }

    /// Set the instancing mode.
    #[must_use]
    pub fn instancing(mut self, instancing: Instancing) -> Self {
        self.instancing = instancing;
        self
    }

    /// Set the configuration policy.
    #[must_use]
    pub fn configuration_policy(mut self, policy: ConfigurationPolicy) -> Self {
        self.configuration_policy = policy;
        self
    }

    /// Set the configuration pid (defaults to the name).
    #[must_use]
    pub fn configuration_pid(mut self, pid: impl Into<String>) -> Self {
        self.pid = Some(pid.into());
        self
    }

    /// Add a static component property.
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key, value);
        self
    }

    /// Set the rule used to rank providers for this component's references.
    #[must_use]
    pub fn ranking_rule(mut self, rule: RankingRule) -> Self {
        self.ranking_rule = rule;
        self
    }

    /// Called after references are bound.
    #[must_use]
    pub fn on_activate<F>(mut self, hook: F) -> Self
    where
        F: Fn(&T, &ComponentContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let hook: Arc<ActivateHook> =
            Arc::new(move |instance: &Instance, ctx: &ComponentContext| {
                hook(downcast::<T>(instance)?, ctx)
            });
        self.activate = Hook::Present(hook);
        self
    }

    /// Called before references are unbound.
    #[must_use]
    pub fn on_deactivate<F>(mut self, hook: F) -> Self
    where
        F: Fn(&T, &ComponentContext, DeactivationReason) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        let hook: Arc<DeactivateHook> = Arc::new(
            move |instance: &Instance, ctx: &ComponentContext, reason: DeactivationReason| {
                hook(downcast::<T>(instance)?, ctx, reason)
            },
        );
        self.deactivate = Hook::Present(hook);
        self
    }

    /// Called on live instances when the configuration record changes.
    /// Without it, a record change disposes the configuration.
    #[must_use]
    pub fn on_modified<F>(mut self, hook: F) -> Self
    where
        F: Fn(&T, &ComponentContext, &Properties) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let hook: Arc<ModifiedHook> = Arc::new(
            move |instance: &Instance, ctx: &ComponentContext, properties: &Properties| {
                hook(downcast::<T>(instance)?, ctx, properties)
            },
        );
        self.modified = Hook::Present(hook);
        self
    }

    /// Called for each provider bound to `reference`.
    #[must_use]
    pub fn on_bind<F>(mut self, reference: &str, hook: F) -> Self
    where
        F: Fn(&T, &ComponentContext, &BoundProvider) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let hook = erase_bind::<T, F>(hook);
        match self.references.iter_mut().find(|r| r.name == reference) {
            Some(r) => r.bind = Hook::Present(hook),
            None => self
                .errors
                .push(format!("bind hook for unknown reference '{reference}'")),
        }
        self
    }

    /// Called for each provider unbound from `reference`.
    #[must_use]
    pub fn on_unbind<F>(mut self, reference: &str, hook: F) -> Self
    where
        F: Fn(&T, &ComponentContext, &BoundProvider) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let hook = erase_bind::<T, F>(hook);
        match self.references.iter_mut().find(|r| r.name == reference) {
            Some(r) => r.unbind = Hook::Present(hook),
            None => self
                .errors
                .push(format!("unbind hook for unknown reference '{reference}'")),
        }
        self
    }

    /// Finish and validate the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::InvalidDescriptor`] if a hook names an
    /// unknown reference or [`ComponentDescriptor::validate`] fails.
    pub fn build(self) -> ComponentResult<ComponentDescriptor> {
        if let Some(error) = self.errors.first() {
            return Err(invalid(format!("{}: {error}", self.name)));
        }
        let descriptor = ComponentDescriptor {
            pid: self.pid.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            factory: self.factory,
            references: self.references,
            provides: self.provides,
            instancing: self.instancing,
            configuration_policy: self.configuration_policy,
            properties: self.properties,
            ranking_rule: self.ranking_rule,
            activate: self.activate,
            deactivate: self.deactivate,
            modified: self.modified,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

fn erase_bind<T, F>(hook: F) -> Arc<BindHook>
where
    T: Send + Sync + 'static,
    F: Fn(&T, &ComponentContext, &BoundProvider) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(
        move |instance: &Instance, ctx: &ComponentContext, bound: &BoundProvider| {
            hook(downcast::<T>(instance)?, ctx, bound)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    fn builder() -> ComponentBuilder<Noop> {
        ComponentDescriptor::builder("noop", || Ok(Noop))
    }

    #[test]
    fn test_pid_defaults_to_name() {
        let d = builder().build().unwrap();
        assert_eq!(d.pid(), "noop");
        let d = builder().configuration_pid("shared.pid").build().unwrap();
        assert_eq!(d.pid(), "shared.pid");
    }

    #[test]
    fn test_duplicate_reference_rejected() {
        let err = builder()
            .reference(ReferenceDescriptor::new("a", "A"))
            .reference(ReferenceDescriptor::new("a", "B"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate reference name 'a'"));
    }

    #[test]
    fn test_empty_names_rejected() {
        assert!(ComponentDescriptor::builder(" ", || Ok(Noop)).build().is_err());
        assert!(
            builder()
                .reference(ReferenceDescriptor::new("", "A"))
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_per_consumer_requires_capability() {
        assert!(builder().instancing(Instancing::PerConsumer).build().is_err());
        assert!(
            builder()
                .instancing(Instancing::PerConsumer)
                .provides("Noop")
                .build()
                .is_ok()
        );
    }

    #[test]
    fn test_bind_hook_for_unknown_reference_rejected() {
        let err = builder()
            .on_bind("missing", |_: &Noop, _, _| Ok(()))
            .build()
            .unwrap_err();
        assert!(matches!(err, ComponentError::InvalidDescriptor(_)));
    }

    #[test]
    fn test_hooks_are_present_only_when_declared() {
        let d = builder()
            .reference(ReferenceDescriptor::new("log", "Log"))
            .on_modified(|_: &Noop, _, _| Ok(()))
            .on_bind("log", |_: &Noop, _, _| Ok(()))
            .build()
            .unwrap();
        assert!(d.has_modified_hook());
        assert!(!d.activate_hook().is_present());
        assert!(d.references()[0].bind_hook().is_present());
        assert!(!d.references()[0].unbind_hook().is_present());
    }

    #[test]
    fn test_base_filter_combines_target() {
        let r = ReferenceDescriptor::new("log", "Log")
            .target(Filter::parse("(level=debug)").unwrap());
        let props = Properties::new()
            .with(keys::OBJECT_CLASS, vec!["Log"])
            .with("level", "debug");
        assert!(r.base_filter().matches(&props));
        assert!(!r.base_filter().matches(&Properties::new().with(keys::OBJECT_CLASS, vec!["Log"])));
        assert_eq!(r.target_property(), "log.target");
    }

    #[test]
    fn test_cardinality_flags() {
        assert!(Cardinality::Optional.is_optional());
        assert!(!Cardinality::Optional.is_multiple());
        assert!(Cardinality::AtLeastOne.is_multiple());
        assert!(!Cardinality::AtLeastOne.is_optional());
        assert_eq!(Cardinality::Multiple.to_string(), "0..n");
    }
}
