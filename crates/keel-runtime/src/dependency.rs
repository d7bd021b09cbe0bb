//! Dependencies and listener consolidation.
//!
//! A dependency tracks providers through one or more [`ReferenceListener`]s.
//! It starts with a single shared listener on its base filter. When a
//! configuration record overrides the reference target, the record's key
//! is split off onto a listener of its own; when keys converge on the same
//! filter again they are merged back. At any time the number of live
//! listeners equals the number of distinct effective filters in use.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use keel_core::{
    CapabilityRegistry, Filter, Properties, ProviderSet, RankingRule, RecordKey, SetDelta,
};
use tracing::{debug, warn};

use crate::descriptor::ReferenceDescriptor;
use crate::listener::{ListenerUpdate, ReferenceListener};

/// Receives provider changes from a dependency's listeners.
pub(crate) trait DependencyObserver: Send + Sync {
    fn dependency_changed(&self, change: ListenerChange);
}

/// A provider-set change seen by every record key in `keys`.
#[derive(Debug, Clone)]
pub(crate) struct ListenerChange {
    /// Position of the dependency in the descriptor.
    pub(crate) index: usize,
    pub(crate) keys: Vec<RecordKey>,
    pub(crate) delta: SetDelta,
    pub(crate) was_available: bool,
    pub(crate) is_available: bool,
}

enum Listeners {
    Shared(Arc<ReferenceListener>),
    PerRecord(BTreeMap<RecordKey, Arc<ReferenceListener>>),
}

impl Listeners {
    fn serving(&self, key: &RecordKey) -> Option<&Arc<ReferenceListener>> {
        match self {
            Self::Shared(shared) => shared.serves(key).then_some(shared),
            Self::PerRecord(map) => map.get(key),
        }
    }

    fn distinct(&self) -> Vec<Arc<ReferenceListener>> {
        match self {
            Self::Shared(shared) => vec![Arc::clone(shared)],
            Self::PerRecord(map) => {
                let mut out: Vec<Arc<ReferenceListener>> = Vec::new();
                for listener in map.values() {
                    if !out.iter().any(|l| Arc::ptr_eq(l, listener)) {
                        out.push(Arc::clone(listener));
                    }
                }
                out
            },
        }
    }
}

/// One declared reference of one component, with its listeners.
pub struct Dependency {
    me: Weak<Self>,
    index: usize,
    component: String,
    reference: ReferenceDescriptor,
    base: Filter,
    registry: Arc<dyn CapabilityRegistry>,
    rule: RankingRule,
    observer: Weak<dyn DependencyObserver>,
    listeners: Mutex<Listeners>,
}

impl Dependency {
    pub(crate) fn new(
        index: usize,
        component: &str,
        reference: ReferenceDescriptor,
        rule: RankingRule,
        registry: Arc<dyn CapabilityRegistry>,
        observer: Weak<dyn DependencyObserver>,
    ) -> Arc<Self> {
        let base = reference.base_filter();
        Arc::new_cyclic(|me: &Weak<Self>| {
            let shared =
                ReferenceListener::new(Arc::clone(&registry), me.clone(), base.clone(), rule);
            Self {
                me: me.clone(),
                index,
                component: component.to_string(),
                reference,
                base,
                registry,
                rule,
                observer,
                listeners: Mutex::new(Listeners::Shared(shared)),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the shared listener.
    pub(crate) fn open(&self) {
        for listener in self.lock().distinct() {
            if !listener.is_started() {
                listener.start();
            }
        }
    }

    /// Stop every listener.
    pub(crate) fn stop_all(&self) {
        for listener in self.lock().distinct() {
            listener.stop();
        }
    }

    /// Reference name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.reference.name()
    }

    /// The declaration this dependency tracks.
    #[must_use]
    pub fn reference(&self) -> &ReferenceDescriptor {
        &self.reference
    }

    /// Position in the component's reference list.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// `objectClass` of the interface intersected with the declared target.
    #[must_use]
    pub fn base_filter(&self) -> &Filter {
        &self.base
    }

    /// The filter in effect for a record with `properties`: the base filter,
    /// narrowed by the record's `<reference>.target` override if it parses.
    #[must_use]
    pub fn effective_filter(&self, properties: &Properties) -> Filter {
        let key = self.reference.target_property();
        let Some(text) = properties.get_str(&key) else {
            return self.base.clone();
        };
        match Filter::parse(text) {
            Ok(target) => self.base.and(&target),
            Err(e) => {
                warn!(
                    component = %self.component,
                    reference = self.reference.name(),
                    target = text,
                    error = %e,
                    "ignoring unparsable target override"
                );
                self.base.clone()
            },
        }
    }

    /// Number of live listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.lock().distinct().len()
    }

    /// Effective filters of the live listeners, in filter text order.
    #[must_use]
    pub fn filters(&self) -> Vec<Filter> {
        let mut filters: Vec<Filter> = self.lock().distinct().iter().map(|l| l.filter()).collect();
        filters.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        filters
    }

    /// Whether every key shares one listener.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        matches!(*self.lock(), Listeners::Shared(_))
    }

    /// The listener serving `key`. An unknown key falls back to a listener
    /// on the base filter, never to one carrying another record's override.
    #[must_use]
    pub fn listener_for(&self, key: &RecordKey) -> Option<Arc<ReferenceListener>> {
        let listeners = self.lock();
        if let Some(listener) = listeners.serving(key) {
            return Some(Arc::clone(listener));
        }
        listeners
            .distinct()
            .into_iter()
            .find(|listener| listener.filter() == self.base)
    }

    /// Whether a provider is available for `key`.
    #[must_use]
    pub fn is_available_for(&self, key: &RecordKey) -> bool {
        self.listener_for(key)
            .is_some_and(|listener| listener.is_available())
    }

    /// Providers matching for `key`, best first.
    pub(crate) fn providers_for(&self, key: &RecordKey) -> ProviderSet {
        self.listener_for(key)
            .map_or_else(|| ProviderSet::new(self.rule), |listener| listener.snapshot())
    }

    /// Attach `key` with the record `properties`, splitting, moving or
    /// retargeting listeners as needed.
    ///
    /// Returns the change seen by `key` if it was already served and its
    /// provider set differs afterwards.
    pub(crate) fn record_changed(
        &self,
        key: &RecordKey,
        properties: &Properties,
    ) -> Option<ListenerChange> {
        let filter = self.effective_filter(properties);
        let mut listeners = self.lock();
        let before = listeners.serving(key).map(|l| l.snapshot());

        let replacement = match &mut *listeners {
            Listeners::Shared(shared) => {
                if shared.filter() == filter {
                    shared.serve(key.clone());
                    None
                } else if shared.serves_only(key) {
                    shared.retarget(filter);
                    shared.serve(key.clone());
                    None
                } else {
                    shared.unserve(key);
                    let mut map: BTreeMap<RecordKey, Arc<ReferenceListener>> = shared
                        .served()
                        .into_iter()
                        .map(|k| (k, Arc::clone(shared)))
                        .collect();
                    map.insert(key.clone(), self.start_listener(filter, key));
                    debug!(
                        component = %self.component,
                        reference = self.reference.name(),
                        "split shared reference listener"
                    );
                    Some(Listeners::PerRecord(map))
                }
            },
            Listeners::PerRecord(map) => {
                match map.get(key).cloned() {
                    Some(current) if current.filter() == filter => {},
                    Some(current) => {
                        let existing = map
                            .values()
                            .find(|l| !Arc::ptr_eq(l, &current) && l.filter() == filter)
                            .cloned();
                        if let Some(existing) = existing {
                            existing.serve(key.clone());
                            map.insert(key.clone(), existing);
                            if current.unserve(key) {
                                current.stop();
                            }
                        } else if current.serves_only(key) {
                            current.retarget(filter);
                        } else {
                            current.unserve(key);
                            map.insert(key.clone(), self.start_listener(filter, key));
                        }
                    },
                    None => {
                        let existing = map.values().find(|l| l.filter() == filter).cloned();
                        let listener = match existing {
                            Some(existing) => {
                                existing.serve(key.clone());
                                existing
                            },
                            None => self.start_listener(filter, key),
                        };
                        map.insert(key.clone(), listener);
                    },
                }
                None
            },
        };
        if let Some(replacement) = replacement {
            *listeners = replacement;
        }
        self.collapse(&mut listeners);

        let after = listeners.serving(key).map(|l| l.snapshot());
        drop(listeners);

        let update = ListenerUpdate::between(&before?, &after.unwrap_or_default());
        (!update.is_noop()).then(|| ListenerChange {
            index: self.index,
            keys: vec![key.clone()],
            delta: update.delta,
            was_available: update.was_available,
            is_available: update.is_available,
        })
    }

    /// Detach `key`. A listener left without keys is stopped, unless it is
    /// the shared one, which falls back to the base filter.
    pub(crate) fn remove_record(&self, key: &RecordKey) {
        let mut listeners = self.lock();
        match &mut *listeners {
            Listeners::Shared(shared) => {
                if shared.unserve(key) && shared.filter() != self.base {
                    shared.retarget(self.base.clone());
                }
            },
            Listeners::PerRecord(map) => {
                if let Some(listener) = map.remove(key)
                    && listener.unserve(key)
                {
                    listener.stop();
                }
            },
        }
        self.collapse(&mut listeners);
    }

    fn start_listener(&self, filter: Filter, key: &RecordKey) -> Arc<ReferenceListener> {
        let listener =
            ReferenceListener::new(Arc::clone(&self.registry), self.me.clone(), filter, self.rule);
        listener.start();
        listener.serve(key.clone());
        listener
    }

    fn collapse(&self, listeners: &mut Listeners) {
        if !matches!(listeners, Listeners::PerRecord(_)) {
            return;
        }
        let distinct = listeners.distinct();
        let only = match distinct.as_slice() {
            [only] => Arc::clone(only),
            [] => {
                let shared = ReferenceListener::new(
                    Arc::clone(&self.registry),
                    self.me.clone(),
                    self.base.clone(),
                    self.rule,
                );
                shared.start();
                shared
            },
            _ => return,
        };
        debug!(
            component = %self.component,
            reference = self.reference.name(),
            filter = %only.filter(),
            "collapsed reference listeners"
        );
        *listeners = Listeners::Shared(only);
    }

    pub(crate) fn listener_changed(&self, keys: Vec<RecordKey>, update: ListenerUpdate) {
        let Some(observer) = self.observer.upgrade() else {
            return;
        };
        observer.dependency_changed(ListenerChange {
            index: self.index,
            keys,
            delta: update.delta,
            was_available: update.was_available,
            is_available: update.is_available,
        });
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("component", &self.component)
            .field("reference", &self.reference.name())
            .field("base", &self.base)
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}
