//! Provider references, the ranking rule, and ranked provider sets.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::ids::ProviderId;
use crate::properties::{Properties, PropertyValue, keys};

/// A snapshot of one registered provider: its id and its properties at the
/// time the snapshot was taken.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRef {
    id: ProviderId,
    ranking: i32,
    properties: Arc<Properties>,
}

impl ProviderRef {
    /// Build a reference; the ranking is read from `service.ranking`
    /// (default 0, out-of-range values clamp to 0).
    #[must_use]
    pub fn new(id: ProviderId, properties: Properties) -> Self {
        let ranking = properties
            .get_i64(keys::SERVICE_RANKING)
            .and_then(|r| i32::try_from(r).ok())
            .unwrap_or(0);
        Self {
            id,
            ranking,
            properties: Arc::new(properties),
        }
    }

    /// Registry id.
    #[must_use]
    pub fn id(&self) -> ProviderId {
        self.id
    }

    /// Priority; higher ranks first.
    #[must_use]
    pub fn ranking(&self) -> i32 {
        self.ranking
    }

    /// Provider properties.
    #[must_use]
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Interfaces this provider was registered under.
    #[must_use]
    pub fn interfaces(&self) -> Vec<&str> {
        match self.properties.get(keys::OBJECT_CLASS) {
            Some(PropertyValue::List(items)) => {
                items.iter().filter_map(PropertyValue::as_str).collect()
            },
            Some(PropertyValue::String(s)) => vec![s.as_str()],
            _ => Vec::new(),
        }
    }
}

/// Total order used to pick "the" provider among several matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RankingRule {
    /// Highest `service.ranking` first; ties go to the earliest registration.
    #[default]
    RankingThenRegistration,
    /// Earliest registration first, ignoring ranking.
    RegistrationOrder,
}

impl RankingRule {
    /// Compare two providers; `Less` means `a` is preferred.
    #[must_use]
    pub fn compare(self, a: &ProviderRef, b: &ProviderRef) -> Ordering {
        match self {
            Self::RankingThenRegistration => {
                b.ranking.cmp(&a.ranking).then_with(|| a.id.cmp(&b.id))
            },
            Self::RegistrationOrder => a.id.cmp(&b.id),
        }
    }
}

/// Net difference between two provider sets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetDelta {
    /// Providers only in the new set, in ascending rank order.
    pub added: Vec<ProviderRef>,
    /// Providers present in both whose snapshot changed (new snapshot).
    pub modified: Vec<ProviderRef>,
    /// Providers only in the old set, in descending rank order.
    pub removed: Vec<ProviderRef>,
}

impl SetDelta {
    /// Whether nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

/// Providers kept sorted by a [`RankingRule`], unique by id.
#[derive(Debug, Clone, Default)]
pub struct ProviderSet {
    rule: RankingRule,
    entries: Vec<ProviderRef>,
}

impl ProviderSet {
    /// An empty set ordered by `rule`.
    #[must_use]
    pub fn new(rule: RankingRule) -> Self {
        Self {
            rule,
            entries: Vec::new(),
        }
    }

    /// Build a set from arbitrary providers.
    #[must_use]
    pub fn from_providers(rule: RankingRule, providers: impl IntoIterator<Item = ProviderRef>) -> Self {
        let mut set = Self::new(rule);
        for provider in providers {
            set.insert(provider);
        }
        set
    }

    /// The ordering rule.
    #[must_use]
    pub fn rule(&self) -> RankingRule {
        self.rule
    }

    /// Insert or replace (by id). Returns the replaced snapshot.
    pub fn insert(&mut self, provider: ProviderRef) -> Option<ProviderRef> {
        let previous = self.remove(provider.id());
        let rule = self.rule;
        let at = self
            .entries
            .partition_point(|e| rule.compare(e, &provider) == Ordering::Less);
        self.entries.insert(at, provider);
        previous
    }

    /// Remove by id.
    pub fn remove(&mut self, id: ProviderId) -> Option<ProviderRef> {
        let at = self.entries.iter().position(|e| e.id() == id)?;
        Some(self.entries.remove(at))
    }

    /// Look up by id.
    #[must_use]
    pub fn get(&self, id: ProviderId) -> Option<&ProviderRef> {
        self.entries.iter().find(|e| e.id() == id)
    }

    /// Whether a provider with this id is present.
    #[must_use]
    pub fn contains(&self, id: ProviderId) -> bool {
        self.get(id).is_some()
    }

    /// The highest-ranked provider.
    #[must_use]
    pub fn best(&self) -> Option<&ProviderRef> {
        self.entries.first()
    }

    /// Providers in rank order.
    pub fn iter(&self) -> impl Iterator<Item = &ProviderRef> {
        self.entries.iter()
    }

    /// Number of providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Providers in rank order, cloned.
    #[must_use]
    pub fn to_vec(&self) -> Vec<ProviderRef> {
        self.entries.clone()
    }

    /// Merge-walk `self` (old) against `next` (new).
    ///
    /// A provider whose ranking changed shows up once in `modified`, not as
    /// an add/remove pair.
    #[must_use]
    pub fn diff(&self, next: &ProviderSet) -> SetDelta {
        let rule = self.rule;
        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut modified = Vec::new();

        let mut old = self.entries.iter().peekable();
        let mut new = next.entries.iter().peekable();
        loop {
            match (old.peek(), new.peek()) {
                (None, None) => break,
                (Some(o), None) => {
                    removed.push((*o).clone());
                    old.next();
                },
                (None, Some(n)) => {
                    added.push((*n).clone());
                    new.next();
                },
                (Some(o), Some(n)) => match rule.compare(o, n) {
                    Ordering::Less => {
                        removed.push((*o).clone());
                        old.next();
                    },
                    Ordering::Greater => {
                        added.push((*n).clone());
                        new.next();
                    },
                    Ordering::Equal => {
                        if o.id() != n.id() || o.properties() != n.properties() {
                            modified.push((*n).clone());
                        }
                        old.next();
                        new.next();
                    },
                },
            }
        }

        let moved: BTreeSet<ProviderId> = removed
            .iter()
            .map(ProviderRef::id)
            .filter(|id| added.iter().any(|a| a.id() == *id))
            .collect();
        if !moved.is_empty() {
            modified.extend(added.iter().filter(|a| moved.contains(&a.id())).cloned());
            added.retain(|a| !moved.contains(&a.id()));
            removed.retain(|r| !moved.contains(&r.id()));
        }
        removed.reverse();

        SetDelta {
            added,
            modified,
            removed,
        }
    }
}
