//! In-memory configuration record store.
//!
//! Records are keyed by pid. A record created through
//! [`ConfigurationStore::create_factory_configuration`] also carries the
//! factory pid it was created for; components that use the factory pid as
//! their configuration pid get one configuration per such record.
//!
//! Changes are broadcast as [`ConfigurationEvent`]s. Delivery is at most
//! once: a receiver that falls more than the channel capacity behind loses
//! the oldest events.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, trace};

use keel_core::{Properties, keys};

/// Default broadcast capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// One stored configuration record.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationRecord {
    /// Record pid.
    pub pid: String,
    /// Factory pid, for records created as factory configurations.
    pub factory_pid: Option<String>,
    /// Record properties, including `service.pid` (and `service.factoryPid`).
    pub properties: Properties,
}

/// What happened to a record.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigurationChange {
    /// Created or updated with these properties.
    Updated(Properties),
    /// Deleted.
    Deleted,
}

/// A record change, as broadcast to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationEvent {
    /// Record pid.
    pub pid: String,
    /// Factory pid, for factory configurations.
    pub factory_pid: Option<String>,
    /// The change.
    pub change: ConfigurationChange,
}

impl ConfigurationEvent {
    /// The pid a component must be configured with to care about this
    /// event: the factory pid if there is one, the record pid otherwise.
    #[must_use]
    pub fn target_pid(&self) -> &str {
        self.factory_pid.as_deref().unwrap_or(&self.pid)
    }
}

/// Read access to configuration records.
pub trait ConfigurationSource: Send + Sync {
    /// Records relevant to a component configured with `pid`: the singleton
    /// record with that pid and every factory record created for it.
    fn records_for(&self, pid: &str) -> Vec<ConfigurationRecord>;
}

/// The in-memory store.
#[derive(Debug)]
pub struct ConfigurationStore {
    records: RwLock<BTreeMap<String, ConfigurationRecord>>,
    sender: broadcast::Sender<ConfigurationEvent>,
}

impl ConfigurationStore {
    /// An empty store with the default channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// An empty store with a specific channel capacity (at least 1).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            records: RwLock::new(BTreeMap::new()),
            sender,
        }
    }

    /// Receive every change made after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigurationEvent> {
        self.sender.subscribe()
    }

    /// Create or replace the record `pid`. An existing factory record keeps
    /// its factory pid.
    pub fn update(&self, pid: &str, properties: Properties) -> ConfigurationRecord {
        let record = {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            let factory_pid = records.get(pid).and_then(|r| r.factory_pid.clone());
            let record = ConfigurationRecord {
                pid: pid.to_owned(),
                properties: stamp(properties, pid, factory_pid.as_deref()),
                factory_pid,
            };
            records.insert(pid.to_owned(), record.clone());
            record
        };
        debug!(pid = %pid, "configuration updated");
        self.publish(ConfigurationEvent {
            pid: record.pid.clone(),
            factory_pid: record.factory_pid.clone(),
            change: ConfigurationChange::Updated(record.properties.clone()),
        });
        record
    }

    /// Create a new factory configuration for `factory_pid`. The generated
    /// pid is `"{factory_pid}~{uuid}"`.
    pub fn create_factory_configuration(
        &self,
        factory_pid: &str,
        properties: Properties,
    ) -> ConfigurationRecord {
        let pid = format!("{factory_pid}~{}", uuid::Uuid::new_v4());
        let record = ConfigurationRecord {
            properties: stamp(properties, &pid, Some(factory_pid)),
            pid: pid.clone(),
            factory_pid: Some(factory_pid.to_owned()),
        };
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid.clone(), record.clone());
        debug!(pid = %pid, factory_pid = %factory_pid, "factory configuration created");
        self.publish(ConfigurationEvent {
            pid,
            factory_pid: record.factory_pid.clone(),
            change: ConfigurationChange::Updated(record.properties.clone()),
        });
        record
    }

    /// Delete the record `pid`. Returns the removed record, if any.
    pub fn delete(&self, pid: &str) -> Option<ConfigurationRecord> {
        let removed = self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(pid)?;
        debug!(pid = %pid, "configuration deleted");
        self.publish(ConfigurationEvent {
            pid: removed.pid.clone(),
            factory_pid: removed.factory_pid.clone(),
            change: ConfigurationChange::Deleted,
        });
        Some(removed)
    }

    /// Look up one record.
    #[must_use]
    pub fn get(&self, pid: &str) -> Option<ConfigurationRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pid)
            .cloned()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, event: ConfigurationEvent) {
        if let Ok(count) = self.sender.send(event) {
            trace!(receiver_count = count, "configuration event published");
        } else {
            trace!("no receivers for configuration event");
        }
    }
}

impl Default for ConfigurationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigurationSource for ConfigurationStore {
    fn records_for(&self, pid: &str) -> Vec<ConfigurationRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| match &r.factory_pid {
                Some(factory_pid) => factory_pid == pid,
                None => r.pid == pid,
            })
            .cloned()
            .collect()
    }
}

fn stamp(mut properties: Properties, pid: &str, factory_pid: Option<&str>) -> Properties {
    properties.insert(keys::SERVICE_PID, pid);
    if let Some(factory_pid) = factory_pid {
        properties.insert(keys::FACTORY_PID, factory_pid);
    }
    properties
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_stamps_pid() {
        let store = ConfigurationStore::new();
        let record = store.update("greeter", Properties::new().with("greeting", "hi"));
        assert_eq!(record.properties.get_str(keys::SERVICE_PID), Some("greeter"));
        assert_eq!(store.get("greeter"), Some(record));
    }

    #[test]
    fn test_records_for_includes_factory_records() {
        let store = ConfigurationStore::new();
        store.update("pool", Properties::new());
        let a = store.create_factory_configuration("pool", Properties::new());
        let b = store.create_factory_configuration("pool", Properties::new());
        store.create_factory_configuration("other", Properties::new());

        assert!(a.pid.starts_with("pool~"));
        assert_ne!(a.pid, b.pid);
        assert_eq!(store.records_for("pool").len(), 3);
        assert_eq!(store.records_for("other").len(), 1);
        assert!(store.records_for("missing").is_empty());
    }

    #[test]
    fn test_update_keeps_factory_pid() {
        let store = ConfigurationStore::new();
        let created = store.create_factory_configuration("pool", Properties::new());
        let updated = store.update(&created.pid, Properties::new().with("size", 3));
        assert_eq!(updated.factory_pid.as_deref(), Some("pool"));
        assert_eq!(updated.properties.get_str(keys::FACTORY_PID), Some("pool"));
    }

    #[tokio::test]
    async fn test_changes_are_broadcast_in_order() {
        let store = ConfigurationStore::new();
        let mut rx = store.subscribe();
        store.update("greeter", Properties::new());
        store.delete("greeter");
        assert!(store.delete("greeter").is_none());

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.change, ConfigurationChange::Updated(_)));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.change, ConfigurationChange::Deleted);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_target_pid_prefers_factory_pid() {
        let event = ConfigurationEvent {
            pid: "pool~1".into(),
            factory_pid: Some("pool".into()),
            change: ConfigurationChange::Deleted,
        };
        assert_eq!(event.target_pid(), "pool");
    }
}
