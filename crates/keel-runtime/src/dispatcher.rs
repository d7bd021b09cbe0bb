//! Asynchronous delivery of configuration record changes.

use std::sync::Arc;

use keel_config::ConfigurationEvent;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::runtime::ComponentRuntime;

/// Applies configuration events from a broadcast stream to a runtime, one
/// at a time and in order.
///
/// Activation and disposal may block on user hooks or on the deactivation
/// bound, so each event runs on tokio's blocking pool. Events dropped by a
/// lagging receiver are logged and skipped.
pub struct ConfigurationDispatcher {
    runtime: Arc<ComponentRuntime>,
    events: broadcast::Receiver<ConfigurationEvent>,
}

impl ConfigurationDispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(
        runtime: Arc<ComponentRuntime>,
        events: broadcast::Receiver<ConfigurationEvent>,
    ) -> Self {
        Self { runtime, events }
    }

    /// Run until the sending side closes.
    pub async fn run(mut self) {
        loop {
            match self.events.recv().await {
                Ok(event) => {
                    let runtime = Arc::clone(&self.runtime);
                    let pid = event.pid.clone();
                    let applied =
                        tokio::task::spawn_blocking(move || runtime.configuration_event(&event))
                            .await;
                    if let Err(e) = applied {
                        error!(pid = %pid, error = %e, "configuration event task failed");
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "configuration dispatcher lagged, events dropped");
                },
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("configuration event stream closed");
                    break;
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_config::{ConfigurationChange, ConfigurationStore, RuntimeSettings};
    use keel_core::Properties;
    use keel_registry::ServiceRegistry;

    use crate::{ComponentDescriptor, ConfigurationPolicy};

    struct Worker;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dispatcher_applies_events_and_stops_on_close() {
        let store = Arc::new(ConfigurationStore::new());
        let runtime = Arc::new(ComponentRuntime::new(
            Arc::new(ServiceRegistry::new()),
            Arc::clone(&store) as Arc<dyn keel_config::ConfigurationSource>,
            &RuntimeSettings::default(),
        ));
        let manager = runtime
            .add_component(
                ComponentDescriptor::builder("worker", || Ok(Worker))
                    .configuration_policy(ConfigurationPolicy::Require)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        assert!(manager.configurations().is_empty());

        let (sender, receiver) = broadcast::channel(8);
        let handle = runtime.spawn_dispatcher(receiver);
        store.update("worker", Properties::new().with("threads", 4));
        sender
            .send(ConfigurationEvent {
                pid: "worker".into(),
                factory_pid: None,
                change: ConfigurationChange::Updated(Properties::new().with("threads", 4)),
            })
            .unwrap();
        drop(sender);
        handle.await.unwrap();

        assert_eq!(manager.configurations().len(), 1);
    }
}
