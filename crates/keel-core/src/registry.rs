//! The capability registry contract consumed by the runtime.
//!
//! The registry itself is a collaborator: the runtime only needs to
//! subscribe to changes for a filter, query the current matches, register
//! its own capabilities behind a factory-style handle, and fetch provider
//! instances on behalf of a consumer.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::error::RegistryResult;
use crate::filter::Filter;
use crate::ids::{ConsumerId, SubscriptionId};
use crate::properties::Properties;
use crate::ranking::ProviderRef;

/// A provider instance as handed out by the registry.
///
/// Consumers downcast to the concrete type they expect.
pub type ServiceObject = Arc<dyn Any + Send + Sync>;

/// A change to a provider, delivered to every subscription whose filter is
/// affected. Events for one provider are delivered in order.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A provider was registered and matches.
    Registered(ProviderRef),
    /// A provider's properties changed and it matches now.
    Modified(ProviderRef),
    /// A provider's properties changed and it no longer matches.
    ModifiedEndMatch(ProviderRef),
    /// A provider is being unregistered; it is still gettable while this
    /// event is delivered.
    Unregistering(ProviderRef),
}

impl RegistryEvent {
    /// The provider snapshot the event refers to.
    #[must_use]
    pub fn provider(&self) -> &ProviderRef {
        match self {
            Self::Registered(p)
            | Self::Modified(p)
            | Self::ModifiedEndMatch(p)
            | Self::Unregistering(p) => p,
        }
    }

    /// Short event name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Registered(_) => "registered",
            Self::Modified(_) => "modified",
            Self::ModifiedEndMatch(_) => "modified_end_match",
            Self::Unregistering(_) => "unregistering",
        }
    }
}

/// Receives registry events for one subscription.
pub trait RegistryListener: Send + Sync {
    /// Handle one event. Called on the thread that changed the registry,
    /// never with registry locks held.
    fn registry_changed(&self, event: &RegistryEvent);
}

/// A provider that produces instances per consumer on demand.
pub trait ProviderFactory: Send + Sync {
    /// Produce (or return the cached) instance for `consumer`.
    ///
    /// # Errors
    ///
    /// Any error is reported to the caller of [`CapabilityRegistry::get`].
    fn get_provider(
        &self,
        consumer: &ConsumerId,
        provider: &ProviderRef,
    ) -> anyhow::Result<ServiceObject>;

    /// `consumer` no longer uses the instance it obtained.
    fn unget_provider(&self, consumer: &ConsumerId, provider: &ProviderRef);
}

/// What a registration hands out when consumers call `get`.
#[derive(Clone)]
pub enum ProviderSource {
    /// One shared object.
    Object(ServiceObject),
    /// A factory consulted for every `get`.
    Factory(Arc<dyn ProviderFactory>),
}

impl fmt::Debug for ProviderSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(_) => f.write_str("ProviderSource::Object"),
            Self::Factory(_) => f.write_str("ProviderSource::Factory"),
        }
    }
}

/// Handle to a registration made through [`CapabilityRegistry::register`].
pub trait Registration: Send + Sync + fmt::Debug {
    /// Current snapshot of the registered provider.
    fn provider(&self) -> ProviderRef;

    /// Replace the provider's properties (`objectClass` and `service.id`
    /// are preserved).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyUnregistered`](crate::RegistryError::AlreadyUnregistered)
    /// after unregistration.
    fn set_properties(&self, properties: Properties) -> RegistryResult<()>;

    /// Withdraw the provider.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyUnregistered`](crate::RegistryError::AlreadyUnregistered)
    /// if called more than once; callers treat that as a no-op.
    fn unregister(&self) -> RegistryResult<()>;
}

/// The capability registry.
pub trait CapabilityRegistry: Send + Sync {
    /// Subscribe `listener` to events for providers matching `filter`.
    ///
    /// The registry keeps only a weak reference; a dropped listener is
    /// pruned on the next delivery.
    fn subscribe(&self, filter: &Filter, listener: Weak<dyn RegistryListener>) -> SubscriptionId;

    /// Cancel a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, subscription: SubscriptionId);

    /// Providers currently matching `filter`, in registration order.
    fn current_matches(&self, filter: &Filter) -> Vec<ProviderRef>;

    /// Register a provider under `interfaces`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidRegistration`](crate::RegistryError::InvalidRegistration)
    /// if no interface is given.
    fn register(
        &self,
        interfaces: &[String],
        source: ProviderSource,
        properties: Properties,
    ) -> RegistryResult<Box<dyn Registration>>;

    /// Obtain the provider's instance for `consumer`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`](crate::RegistryError::NotFound) if
    /// the provider is gone, or [`RegistryError::Factory`](crate::RegistryError::Factory)
    /// if its factory failed.
    fn get(&self, provider: &ProviderRef, consumer: &ConsumerId) -> RegistryResult<ServiceObject>;

    /// Release an instance obtained through [`get`](Self::get).
    fn unget(&self, provider: &ProviderRef, consumer: &ConsumerId);
}
