//! Listener consolidation driven by per-record target overrides.

use std::sync::Arc;

use keel_core::{Filter, Properties, RecordKey};
use keel_runtime::{ComponentManager, ConfigurationPolicy, ReferenceDescriptor};
use keel_test::{
    EventLog, GREETER, Greeter, TestRuntime, recording_component, register_greeter,
};

fn router(harness: &TestRuntime, log: &EventLog) -> Arc<ComponentManager> {
    harness
        .runtime
        .add_component(
            recording_component("router", log)
                .reference(ReferenceDescriptor::new("greeter", GREETER).dynamic())
                .configuration_policy(ConfigurationPolicy::Require)
                .build()
                .unwrap(),
        )
        .unwrap()
}

fn targeting(name: &str) -> Properties {
    Properties::new().with("greeter.target", format!("(name={name})"))
}

/// Create `records` factory records cycling through `k` distinct targets and
/// check the live listener count.
fn assert_listener_count(records: usize, k: usize) {
    let harness = TestRuntime::new();
    let log = EventLog::new();
    let _a = register_greeter(&harness.registry, "t0", 0);
    let _b = register_greeter(&harness.registry, "t1", 0);
    let manager = router(&harness, &log);

    for i in 0..records {
        harness.create_factory_config("router", targeting(&format!("t{}", i % k)));
    }
    let dependency = manager.dependency("greeter").unwrap();
    assert_eq!(dependency.listener_count(), k, "records={records} k={k}");
    assert_eq!(dependency.filters().len(), k);
    assert_eq!(harness.registry.subscription_count(), k);
    assert_eq!(dependency.is_shared(), k == 1);
    assert_eq!(manager.configurations().len(), records);

    for configuration in manager.configurations() {
        let expected = configuration
            .record_properties()
            .get_str("greeter.target")
            .map(|t| t.trim_start_matches("(name=").trim_end_matches(')').to_string());
        let bound = configuration.contexts()[0]
            .service::<Greeter>("greeter")
            .map(|g| g.name().to_string());
        assert_eq!(bound, expected);
    }
}

#[test]
fn test_listener_count_matches_distinct_filters() {
    for (records, k) in [(1, 1), (2, 1), (2, 2), (5, 1), (5, 2)] {
        assert_listener_count(records, k);
    }
}

#[test]
fn test_collapse_after_removing_all_but_one_record() {
    let harness = TestRuntime::new();
    let log = EventLog::new();
    let manager = router(&harness, &log);
    let pids: Vec<String> = (0..4)
        .map(|i| {
            harness
                .create_factory_config("router", targeting(&format!("t{i}")))
                .pid
        })
        .collect();
    let dependency = manager.dependency("greeter").unwrap();
    assert_eq!(dependency.listener_count(), 4);

    for pid in &pids[1..] {
        harness.delete_config(pid);
    }
    assert!(dependency.is_shared());
    assert_eq!(dependency.listener_count(), 1);
    assert_eq!(harness.registry.subscription_count(), 1);
    let expected = dependency.base_filter().and(&Filter::parse("(name=t0)").unwrap());
    assert_eq!(dependency.filters(), vec![expected.clone()]);

    // Re-applying the survivor's record changes nothing.
    harness.update_config(&pids[0], targeting("t0"));
    assert!(dependency.is_shared());
    assert_eq!(dependency.filters(), vec![expected]);
    assert_eq!(harness.registry.subscription_count(), 1);
}

#[test]
fn test_deleting_every_record_restores_the_base_listener() {
    let harness = TestRuntime::new();
    let log = EventLog::new();
    let manager = router(&harness, &log);
    let first = harness.create_factory_config("router", targeting("t0")).pid;
    let second = harness.create_factory_config("router", targeting("t1")).pid;
    let dependency = manager.dependency("greeter").unwrap();
    assert_eq!(dependency.listener_count(), 2);

    harness.delete_config(&first);
    harness.delete_config(&second);
    assert!(dependency.is_shared());
    assert_eq!(dependency.listener_count(), 1);
    assert_eq!(harness.registry.subscription_count(), 1);
    assert!(manager.record_keys().is_empty());
    assert_eq!(dependency.filters(), vec![dependency.base_filter().clone()]);
    assert!(
        dependency
            .listener_for(&RecordKey::Unconfigured)
            .unwrap()
            .served()
            .is_empty()
    );
}

#[test]
fn test_retargeted_record_rebinds_its_configuration() {
    let harness = TestRuntime::new();
    let log = EventLog::new();
    let _t0 = register_greeter(&harness.registry, "t0", 0);
    let _t1 = register_greeter(&harness.registry, "t1", 0);
    let manager = router(&harness, &log);
    let record = harness.create_factory_config("router", targeting("t0"));
    let key = RecordKey::pid(record.pid.as_str());
    let configuration = manager.configuration(&key).unwrap();

    harness.update_config(&record.pid, targeting("t1"));
    // Without a modified hook the record change replaces the configuration.
    let replacement = manager.configuration(&key).unwrap();
    assert!(replacement.id() > configuration.id());
    let bound = replacement.contexts()[0]
        .service::<Greeter>("greeter")
        .map(|g| g.name().to_string());
    assert_eq!(bound.as_deref(), Some("t1"));
    assert_eq!(manager.dependency("greeter").unwrap().listener_count(), 1);
}
