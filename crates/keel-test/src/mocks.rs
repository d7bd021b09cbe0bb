//! Recording components.

use std::sync::{Arc, Mutex};

use keel_core::keys;
use keel_runtime::{BoundProvider, ComponentBuilder, ComponentDescriptor};

/// An append-only log of lifecycle events, shared between hooks and the
/// test body.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn record(&self, entry: impl Into<String>) {
        if let Ok(mut guard) = self.entries.lock() {
            guard.push(entry.into());
        }
    }

    /// Snapshot of every entry so far.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().map(|g| g.clone()).unwrap_or_default()
    }

    /// Entries containing `needle`.
    #[must_use]
    pub fn matching(&self, needle: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.contains(needle))
            .collect()
    }

    /// How many entries contain `needle`.
    #[must_use]
    pub fn count(&self, needle: &str) -> usize {
        self.matching(needle).len()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        if let Ok(mut guard) = self.entries.lock() {
            guard.clear();
        }
    }
}

/// Implementation object of [`recording_component`].
#[derive(Debug)]
pub struct Recorder {
    component: String,
}

impl Recorder {
    /// Name of the component that created this instance.
    #[must_use]
    pub fn component(&self) -> &str {
        &self.component
    }
}

/// A component builder whose factory and lifecycle hooks append to `log`:
/// `"<name> new"`, `"<name> activate"` and `"<name> deactivate <reason>"`.
///
/// There is no modified hook, so a record change disposes the
/// configuration; see [`record_modified`].
#[must_use]
pub fn recording_component(name: &str, log: &EventLog) -> ComponentBuilder<Recorder> {
    let component = name.to_string();
    let (new_log, activate_log, deactivate_log) = (log.clone(), log.clone(), log.clone());
    ComponentDescriptor::builder(name, move || {
        new_log.record(format!("{component} new"));
        Ok(Recorder {
            component: component.clone(),
        })
    })
    .on_activate(move |r: &Recorder, _| {
        activate_log.record(format!("{} activate", r.component));
        Ok(())
    })
    .on_deactivate(move |r: &Recorder, _, reason| {
        deactivate_log.record(format!("{} deactivate {reason}", r.component));
        Ok(())
    })
}

/// Add a modified hook recording `"<name> modified"`.
#[must_use]
pub fn record_modified(
    builder: ComponentBuilder<Recorder>,
    log: &EventLog,
) -> ComponentBuilder<Recorder> {
    let log = log.clone();
    builder.on_modified(move |r: &Recorder, _, _| {
        log.record(format!("{} modified", r.component));
        Ok(())
    })
}

/// Add bind/unbind hooks on `reference` recording
/// `"<component> bind <reference>=<provider>"` and the matching unbind.
///
/// The provider is named by its `name` property, or its `service.id`.
#[must_use]
pub fn record_bindings(
    builder: ComponentBuilder<Recorder>,
    reference: &str,
    log: &EventLog,
) -> ComponentBuilder<Recorder> {
    let (bind_log, unbind_log) = (log.clone(), log.clone());
    let (bind_ref, unbind_ref) = (reference.to_string(), reference.to_string());
    builder
        .on_bind(reference, move |r: &Recorder, _, bound| {
            bind_log.record(format!("{} bind {bind_ref}={}", r.component, label(bound)));
            Ok(())
        })
        .on_unbind(reference, move |r: &Recorder, _, bound| {
            unbind_log.record(format!("{} unbind {unbind_ref}={}", r.component, label(bound)));
            Ok(())
        })
}

fn label(bound: &BoundProvider) -> String {
    let properties = bound.provider().properties();
    properties.get_str("name").map_or_else(
        || {
            properties
                .get_i64(keys::SERVICE_ID)
                .unwrap_or_default()
                .to_string()
        },
        str::to_string,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_log_filters() {
        let log = EventLog::new();
        log.record("a activate");
        log.record("b activate");
        log.record("a deactivate disabled");
        assert_eq!(log.count("activate"), 3);
        assert_eq!(log.matching("a "), vec!["a activate", "a deactivate disabled"]);
        log.clear();
        assert!(log.entries().is_empty());
    }

    #[test]
    fn test_recording_component_builds() {
        let log = EventLog::new();
        let descriptor = recording_component("probe", &log).build().unwrap();
        assert_eq!(descriptor.name(), "probe");
        assert!(!descriptor.has_modified_hook());
        assert!(log.entries().is_empty());

        let descriptor = record_modified(recording_component("probe", &log), &log)
            .build()
            .unwrap();
        assert!(descriptor.has_modified_hook());
    }
}
