//! Configuration records: policies, modified hooks, factory records,
//! registered properties and asynchronous dispatch from the store.

use std::time::Duration;

use keel_config::ConfigurationSource;
use keel_core::{Properties, RecordKey, keys};
use keel_runtime::{ConfigurationPolicy, ConfigurationState, ReferenceDescriptor};
use keel_test::{
    EventLog, GREETER, TestRuntime, eventually, record_modified, recording_component,
    register_greeter,
};

#[test]
fn test_optional_policy_swaps_between_unconfigured_and_record() {
    let harness = TestRuntime::new();
    let log = EventLog::new();
    let manager = harness
        .runtime
        .add_component(recording_component("clock", &log).build().unwrap())
        .unwrap();
    assert_eq!(manager.record_keys(), vec![RecordKey::Unconfigured]);
    let unconfigured = manager.configuration(&RecordKey::Unconfigured).unwrap();

    harness.update_config("clock", Properties::new().with("tick_ms", 10));
    assert_eq!(manager.record_keys(), vec![RecordKey::pid("clock")]);
    assert_eq!(unconfigured.state(), ConfigurationState::Deactive);
    let configured = manager.configuration(&RecordKey::pid("clock")).unwrap();
    assert_eq!(configured.record_properties().get_i64("tick_ms"), Some(10));
    assert_eq!(
        configured.contexts()[0].property("tick_ms").and_then(|v| v.as_i64()),
        Some(10)
    );

    harness.delete_config("clock");
    assert_eq!(configured.state(), ConfigurationState::Deactive);
    assert_eq!(manager.record_keys(), vec![RecordKey::Unconfigured]);
    assert!(manager.configuration(&RecordKey::Unconfigured).is_some());
    assert_eq!(log.count("clock deactivate configuration modified"), 1);
    assert_eq!(log.count("clock deactivate configuration deleted"), 1);
    assert_eq!(log.count("clock activate"), 3);
}

#[test]
fn test_ignore_policy_never_sees_records() {
    let harness = TestRuntime::new();
    let log = EventLog::new();
    let manager = harness
        .runtime
        .add_component(
            recording_component("static", &log)
                .configuration_policy(ConfigurationPolicy::Ignore)
                .build()
                .unwrap(),
        )
        .unwrap();
    harness.update_config("static", Properties::new().with("x", 1));
    assert_eq!(manager.record_keys(), vec![RecordKey::Unconfigured]);
    assert_eq!(log.count("activate"), 1);
    assert_eq!(log.count("deactivate"), 0);
}

#[test]
fn test_modified_hook_keeps_the_instance() {
    let harness = TestRuntime::new();
    let log = EventLog::new();
    harness.update_config("cache", Properties::new().with("size", 16));
    let manager = harness
        .runtime
        .add_component(
            record_modified(recording_component("cache", &log), &log)
                .provides("Cache")
                .configuration_policy(ConfigurationPolicy::Require)
                .property("tier", "memory")
                .build()
                .unwrap(),
        )
        .unwrap();
    let configuration = manager.configuration(&RecordKey::pid("cache")).unwrap();
    let consumer = keel_test::test_consumer();
    configuration.activate(&consumer).unwrap();

    harness.update_config(
        "cache",
        Properties::new().with("size", 64).with(".password", "hunter2"),
    );
    assert_eq!(log.count("cache new"), 1);
    assert_eq!(log.count("cache modified"), 1);
    assert_eq!(configuration.state(), ConfigurationState::Active);
    assert_eq!(
        configuration.contexts()[0].property("size").and_then(|v| v.as_i64()),
        Some(64)
    );

    let registered = configuration.registered_provider().unwrap();
    let properties = registered.properties();
    assert_eq!(properties.get_i64("size"), Some(64));
    assert_eq!(properties.get_str("tier"), Some("memory"));
    assert_eq!(properties.get_str(keys::COMPONENT_NAME), Some("cache"));
    assert_eq!(properties.get_str(keys::SERVICE_PID), Some("cache"));
    assert!(!properties.contains_key(".password"));
}

#[test]
fn test_modified_record_can_unsatisfy_a_reference() {
    let harness = TestRuntime::new();
    let log = EventLog::new();
    let _a = register_greeter(&harness.registry, "a", 0);
    harness.update_config("door", Properties::new().with("greeter.target", "(name=a)"));
    let manager = harness
        .runtime
        .add_component(
            record_modified(recording_component("door", &log), &log)
                .reference(ReferenceDescriptor::new("greeter", GREETER))
                .build()
                .unwrap(),
        )
        .unwrap();
    let configuration = manager.configuration(&RecordKey::pid("door")).unwrap();
    assert_eq!(configuration.state(), ConfigurationState::Active);

    harness.update_config("door", Properties::new().with("greeter.target", "(name=z)"));
    assert_eq!(configuration.state(), ConfigurationState::Deactive);
    assert!(manager.configurations().is_empty());
    assert_eq!(log.count("door deactivate reference unsatisfied"), 1);
    assert_eq!(log.count("door modified"), 0);

    let _z = register_greeter(&harness.registry, "z", 0);
    assert_eq!(manager.configurations().len(), 1);
}

#[test]
fn test_factory_records_each_get_a_configuration() {
    let harness = TestRuntime::new();
    let log = EventLog::new();
    let manager = harness
        .runtime
        .add_component(
            recording_component("worker", &log)
                .provides("Worker")
                .configuration_policy(ConfigurationPolicy::Require)
                .build()
                .unwrap(),
        )
        .unwrap();
    let first = harness.create_factory_config("worker", Properties::new().with("queue", "a"));
    let second = harness.create_factory_config("worker", Properties::new().with("queue", "b"));
    assert!(first.pid.starts_with("worker~"));
    assert_eq!(harness.store.records_for("worker").len(), 2);
    assert_eq!(manager.configurations().len(), 2);
    assert_eq!(harness.registry.provider_count(), 2);

    let configuration = manager
        .configuration(&RecordKey::pid(first.pid.as_str()))
        .unwrap();
    let properties = configuration.registered_properties();
    assert_eq!(properties.get_str("queue"), Some("a"));
    assert_eq!(properties.get_str(keys::FACTORY_PID), Some("worker"));
    assert_eq!(properties.get_str(keys::SERVICE_PID), Some(first.pid.as_str()));

    harness.delete_config(&second.pid);
    assert_eq!(manager.configurations().len(), 1);
    assert_eq!(harness.registry.provider_count(), 1);
    // Nothing was ever activated, so nothing was deactivated.
    assert!(log.entries().is_empty());
}

#[test]
fn test_runtime_rejects_invalid_and_duplicate_descriptors() {
    let harness = TestRuntime::new();
    let log = EventLog::new();
    assert!(recording_component("", &log).build().is_err());
    harness
        .runtime
        .add_component(recording_component("one", &log).build().unwrap())
        .unwrap();
    let err = harness
        .runtime
        .add_component(recording_component("one", &log).build().unwrap())
        .unwrap_err();
    assert!(err.to_string().contains("already registered"), "{err}");
    assert!(harness.runtime.remove_component("two").is_err());
    harness.runtime.remove_component("one").unwrap();
    assert!(harness.runtime.components().is_empty());
    assert_eq!(log.count("one deactivate disabled"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispatcher_applies_store_changes() {
    let harness = TestRuntime::new();
    let log = EventLog::new();
    let manager = harness
        .runtime
        .add_component(
            recording_component("poller", &log)
                .configuration_policy(ConfigurationPolicy::Require)
                .build()
                .unwrap(),
        )
        .unwrap();
    let dispatcher = harness.runtime.spawn_dispatcher(harness.store.subscribe());

    harness
        .store
        .update("poller", Properties::new().with("interval_ms", 100));
    assert!(eventually(Duration::from_secs(2), || manager.configurations().len() == 1).await);

    let record = harness
        .store
        .create_factory_configuration("poller", Properties::new());
    assert!(eventually(Duration::from_secs(2), || manager.configurations().len() == 2).await);

    harness.store.delete(&record.pid);
    harness.store.delete("poller");
    assert!(eventually(Duration::from_secs(2), || manager.configurations().is_empty()).await);
    assert_eq!(log.count("poller deactivate configuration deleted"), 2);

    dispatcher.abort();
}

#[test]
fn test_settings_file_bounds_deactivation() {
    let harness =
        TestRuntime::from_settings_file("[activation]\ndeactivation_timeout_ms = 75\n");
    assert_eq!(
        harness.runtime.deactivation_timeout(),
        Duration::from_millis(75)
    );
}
