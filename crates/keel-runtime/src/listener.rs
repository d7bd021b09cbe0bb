//! Reference listeners: the live, ranked provider set for one effective
//! filter of one dependency.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use keel_core::{
    CapabilityRegistry, Filter, ProviderRef, ProviderSet, RankingRule, RecordKey, RegistryEvent,
    RegistryListener, SetDelta, SubscriptionId,
};
use tracing::{debug, trace};

use crate::dependency::Dependency;

/// Outcome of recomputing a listener's provider set.
#[derive(Debug, Clone, Default)]
pub(crate) struct ListenerUpdate {
    pub(crate) delta: SetDelta,
    pub(crate) was_available: bool,
    pub(crate) is_available: bool,
}

impl ListenerUpdate {
    pub(crate) fn between(before: &ProviderSet, after: &ProviderSet) -> Self {
        Self {
            delta: before.diff(after),
            was_available: !before.is_empty(),
            is_available: !after.is_empty(),
        }
    }

    pub(crate) fn is_noop(&self) -> bool {
        self.delta.is_empty() && self.was_available == self.is_available
    }
}

struct ListenerState {
    filter: Filter,
    subscription: Option<SubscriptionId>,
    providers: ProviderSet,
    served: BTreeSet<RecordKey>,
}

/// Tracks the providers matching one effective filter on behalf of every
/// record key that uses that filter.
///
/// All record keys served by a listener share its filter. Notifications to
/// the owning dependency are sent after the provider-set lock is released.
pub struct ReferenceListener {
    me: Weak<Self>,
    registry: Arc<dyn CapabilityRegistry>,
    owner: Weak<Dependency>,
    state: Mutex<ListenerState>,
}

impl ReferenceListener {
    pub(crate) fn new(
        registry: Arc<dyn CapabilityRegistry>,
        owner: Weak<Dependency>,
        filter: Filter,
        rule: RankingRule,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            registry,
            owner,
            state: Mutex::new(ListenerState {
                filter,
                subscription: None,
                providers: ProviderSet::new(rule),
                served: BTreeSet::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe and seed from the registry's present state.
    pub(crate) fn start(&self) -> ListenerUpdate {
        let mut state = self.lock();
        let filter = state.filter.clone();
        self.attach(&mut state, filter)
    }

    /// Switch to `filter`, replacing the subscription and reseeding.
    ///
    /// The returned delta lists additions in rank order followed by
    /// removals in reverse rank order, so dependents see only the net change.
    pub(crate) fn retarget(&self, filter: Filter) -> ListenerUpdate {
        let mut state = self.lock();
        debug!(from = %state.filter, to = %filter, "retargeting reference listener");
        self.attach(&mut state, filter)
    }

    fn attach(&self, state: &mut ListenerState, filter: Filter) -> ListenerUpdate {
        let listener: Weak<dyn RegistryListener> = self.me.clone();
        let subscription = self.registry.subscribe(&filter, listener);
        if let Some(previous) = state.subscription.replace(subscription) {
            self.registry.unsubscribe(previous);
        }
        let next = ProviderSet::from_providers(
            state.providers.rule(),
            self.registry.current_matches(&filter),
        );
        let update = ListenerUpdate::between(&state.providers, &next);
        state.filter = filter;
        state.providers = next;
        update
    }

    /// Cancel the subscription and forget every provider and key.
    pub(crate) fn stop(&self) {
        let mut state = self.lock();
        if let Some(subscription) = state.subscription.take() {
            self.registry.unsubscribe(subscription);
        }
        state.providers = ProviderSet::new(state.providers.rule());
        state.served.clear();
        trace!(filter = %state.filter, "reference listener stopped");
    }

    /// Whether the listener holds a registry subscription.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.lock().subscription.is_some()
    }

    /// The effective filter.
    #[must_use]
    pub fn filter(&self) -> Filter {
        self.lock().filter.clone()
    }

    /// Matching providers, best first.
    #[must_use]
    pub fn snapshot(&self) -> ProviderSet {
        self.lock().providers.clone()
    }

    /// The highest-ranked matching provider.
    #[must_use]
    pub fn best(&self) -> Option<ProviderRef> {
        self.lock().providers.best().cloned()
    }

    /// Whether at least one provider matches.
    #[must_use]
    pub fn is_available(&self) -> bool {
        !self.lock().providers.is_empty()
    }

    /// Record keys served by this listener.
    #[must_use]
    pub fn served(&self) -> Vec<RecordKey> {
        self.lock().served.iter().cloned().collect()
    }

    pub(crate) fn serves(&self, key: &RecordKey) -> bool {
        self.lock().served.contains(key)
    }

    /// Whether no key other than `key` is served.
    pub(crate) fn serves_only(&self, key: &RecordKey) -> bool {
        self.lock().served.iter().all(|k| k == key)
    }

    pub(crate) fn serve(&self, key: RecordKey) {
        self.lock().served.insert(key);
    }

    /// Detach `key`; returns whether the listener is now unused.
    pub(crate) fn unserve(&self, key: &RecordKey) -> bool {
        let mut state = self.lock();
        state.served.remove(key);
        state.served.is_empty()
    }
}

impl RegistryListener for ReferenceListener {
    fn registry_changed(&self, event: &RegistryEvent) {
        let (update, keys) = {
            let mut state = self.lock();
            if state.subscription.is_none() {
                return;
            }
            let provider = event.provider();
            let mut next = state.providers.clone();
            // Events from a subscription being replaced may still arrive;
            // membership always follows the current filter.
            let matches = !matches!(event, RegistryEvent::Unregistering(_))
                && state.filter.matches(provider.properties());
            if matches {
                next.insert(provider.clone());
            } else {
                next.remove(provider.id());
            }
            let update = ListenerUpdate::between(&state.providers, &next);
            if update.is_noop() {
                return;
            }
            trace!(
                event = event.kind(),
                provider_id = %provider.id(),
                filter = %state.filter,
                "reference listener updated"
            );
            state.providers = next;
            (update, state.served.iter().cloned().collect::<Vec<_>>())
        };

        if let Some(owner) = self.owner.upgrade() {
            owner.listener_changed(keys, update);
        }
    }
}

impl fmt::Debug for ReferenceListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ReferenceListener")
            .field("filter", &state.filter)
            .field("providers", &state.providers.len())
            .field("served", &state.served)
            .field("started", &state.subscription.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Properties, Registration, keys};
    use keel_registry::ServiceRegistry;

    fn greeter(ranking: i32) -> Properties {
        Properties::new().with(keys::SERVICE_RANKING, ranking)
    }

    fn listener(registry: &ServiceRegistry, filter: &str) -> Arc<ReferenceListener> {
        ReferenceListener::new(
            Arc::new(registry.clone()),
            Weak::new(),
            Filter::parse(filter).unwrap(),
            RankingRule::default(),
        )
    }

    #[test]
    fn test_start_seeds_from_registry() {
        let registry = ServiceRegistry::new();
        let _a = registry
            .register_object(&["Greeter"], Arc::new(()), greeter(1))
            .unwrap();
        let listener = listener(&registry, "(objectClass=Greeter)");

        let update = listener.start();
        assert!(!update.was_available);
        assert!(update.is_available);
        assert_eq!(update.delta.added.len(), 1);
        assert_eq!(registry.subscription_count(), 1);
    }

    #[test]
    fn test_live_events_update_best_provider() {
        let registry = ServiceRegistry::new();
        let listener = listener(&registry, "(objectClass=Greeter)");
        listener.start();
        assert!(!listener.is_available());

        let low = registry
            .register_object(&["Greeter"], Arc::new(()), greeter(1))
            .unwrap();
        let high = registry
            .register_object(&["Greeter"], Arc::new(()), greeter(9))
            .unwrap();
        assert_eq!(listener.best().map(|p| p.id()), Some(high.id()));

        high.unregister().unwrap();
        assert_eq!(listener.best().map(|p| p.id()), Some(low.id()));

        low.set_properties(greeter(1).with("tier", 2)).unwrap();
        assert_eq!(listener.snapshot().len(), 1);
    }

    #[test]
    fn test_retarget_reports_net_delta() {
        let registry = ServiceRegistry::new();
        let a = registry
            .register_object(&["Greeter"], Arc::new(()), greeter(0).with("lang", "en"))
            .unwrap();
        let b = registry
            .register_object(&["Greeter"], Arc::new(()), greeter(0).with("lang", "fr"))
            .unwrap();
        let listener = listener(&registry, "(objectClass=Greeter)");
        listener.start();

        let update = listener.retarget(Filter::parse("(&(objectClass=Greeter)(lang=fr))").unwrap());
        assert!(update.delta.added.is_empty());
        assert_eq!(update.delta.removed.len(), 1);
        assert_eq!(update.delta.removed[0].id(), a.id());
        assert_eq!(listener.best().map(|p| p.id()), Some(b.id()));
        assert_eq!(registry.subscription_count(), 1);
    }

    #[test]
    fn test_stop_unsubscribes_and_ignores_late_events() {
        let registry = ServiceRegistry::new();
        let listener = listener(&registry, "(objectClass=Greeter)");
        listener.start();
        listener.serve(RecordKey::Unconfigured);
        listener.stop();

        assert_eq!(registry.subscription_count(), 0);
        assert!(listener.served().is_empty());
        let event = RegistryEvent::Registered(ProviderRef::new(
            keel_core::ProviderId(99),
            Properties::new().with(keys::OBJECT_CLASS, vec!["Greeter"]),
        ));
        listener.registry_changed(&event);
        assert!(!listener.is_available());
    }

    #[test]
    fn test_served_keys() {
        let registry = ServiceRegistry::new();
        let listener = listener(&registry, "(objectClass=Greeter)");
        let a = RecordKey::pid("a");
        listener.serve(a.clone());
        assert!(listener.serves_only(&a));
        listener.serve(RecordKey::pid("b"));
        assert!(!listener.serves_only(&a));
        assert!(!listener.unserve(&a));
        assert!(listener.unserve(&RecordKey::pid("b")));
    }
}
