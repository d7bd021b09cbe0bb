//! Reference binding: declaration order, rebinding policies, ranking and
//! satisfaction.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use keel_core::{ConsumerId, Properties, RecordKey, Registration};
use keel_runtime::{
    Cardinality, ComponentDescriptor, ComponentManager, ConfigurationState, ReferenceDescriptor,
};
use keel_test::{
    EventLog, GREETER, Greeter, TestRuntime, record_bindings, recording_component,
    register_greeter,
};

fn greeting(manager: &ComponentManager) -> Option<String> {
    let configuration = manager.configuration(&RecordKey::Unconfigured)?;
    let ctx = configuration.contexts().into_iter().next()?;
    ctx.service::<Greeter>("greeter").map(|g| g.name().to_string())
}

fn door(
    harness: &TestRuntime,
    log: &EventLog,
    reference: ReferenceDescriptor,
) -> Arc<ComponentManager> {
    let builder = recording_component("door", log).reference(reference);
    harness
        .runtime
        .add_component(record_bindings(builder, "greeter", log).build().unwrap())
        .unwrap()
}

#[test]
fn test_references_unbind_in_reverse_order() {
    let harness = TestRuntime::new();
    let log = EventLog::new();
    for name in ["a", "b", "c"] {
        let interface = name.to_uppercase();
        harness
            .registry
            .register_object(
                &[interface.as_str()],
                Arc::new(name.to_string()),
                Properties::new().with("name", name),
            )
            .unwrap();
    }
    let mut builder = recording_component("multi", &log);
    for name in ["a", "b", "c"] {
        builder = builder.reference(ReferenceDescriptor::new(name, name.to_uppercase()));
    }
    for name in ["a", "b", "c"] {
        builder = record_bindings(builder, name, &log);
    }
    harness.runtime.add_component(builder.build().unwrap()).unwrap();
    harness.runtime.disable("multi").unwrap();

    assert_eq!(
        log.entries(),
        vec![
            "multi new",
            "multi bind a=a",
            "multi bind b=b",
            "multi bind c=c",
            "multi activate",
            "multi deactivate disabled",
            "multi unbind c=c",
            "multi unbind b=b",
            "multi unbind a=a",
        ]
    );
}

#[test]
fn test_dynamic_reference_rebinds_in_place() {
    let harness = TestRuntime::new();
    let log = EventLog::new();
    let _low = register_greeter(&harness.registry, "low", 1);
    let manager = door(
        &harness,
        &log,
        ReferenceDescriptor::new("greeter", GREETER).dynamic(),
    );
    assert_eq!(greeting(&manager).as_deref(), Some("low"));

    let high = register_greeter(&harness.registry, "high", 10);
    assert_eq!(greeting(&manager).as_deref(), Some("high"));

    high.unregister().unwrap();
    assert_eq!(greeting(&manager).as_deref(), Some("low"));

    assert_eq!(
        log.entries(),
        vec![
            "door new",
            "door bind greeter=low",
            "door activate",
            "door bind greeter=high",
            "door unbind greeter=low",
            "door bind greeter=low",
            "door unbind greeter=high",
        ]
    );
    assert_eq!(log.count("deactivate"), 0);
}

#[test]
fn test_static_reference_cycles_once_per_change() {
    let harness = TestRuntime::new();
    let log = EventLog::new();
    let _low = register_greeter(&harness.registry, "low", 1);
    let manager = door(&harness, &log, ReferenceDescriptor::new("greeter", GREETER));
    let first_id = manager.configurations()[0].id();

    let high = register_greeter(&harness.registry, "high", 10);
    assert_eq!(greeting(&manager).as_deref(), Some("high"));
    assert_eq!(
        log.entries()[3..],
        [
            "door deactivate reference rebind",
            "door unbind greeter=low",
            "door new",
            "door bind greeter=high",
            "door activate",
        ]
    );
    assert_eq!(log.count("deactivate"), 1);
    assert_eq!(log.count(" activate"), 2);

    // A lower-ranked arrival leaves the bound provider alone.
    let _lowest = register_greeter(&harness.registry, "lowest", 0);
    assert_eq!(log.count("deactivate"), 1);

    high.unregister().unwrap();
    assert_eq!(greeting(&manager).as_deref(), Some("low"));
    assert_eq!(log.count("deactivate reference rebind"), 2);

    // The configuration itself survives every rebind.
    assert_eq!(manager.configurations()[0].id(), first_id);
    assert_eq!(
        manager.configurations()[0].state(),
        ConfigurationState::Active
    );
}

#[test]
fn test_mandatory_reference_loss_disposes_and_recovers() {
    let harness = TestRuntime::new();
    let log = EventLog::new();
    let manager = door(&harness, &log, ReferenceDescriptor::new("greeter", GREETER));
    assert!(manager.configurations().is_empty());
    assert!(log.entries().is_empty());

    let only = register_greeter(&harness.registry, "only", 0);
    let first = manager.configuration(&RecordKey::Unconfigured).unwrap();
    assert_eq!(first.state(), ConfigurationState::Active);

    only.unregister().unwrap();
    assert!(manager.configurations().is_empty());
    assert_eq!(first.state(), ConfigurationState::Deactive);
    assert_eq!(log.count("door deactivate reference unsatisfied"), 1);
    assert_eq!(log.count("door unbind greeter=only"), 1);

    let _again = register_greeter(&harness.registry, "again", 0);
    let second = manager.configuration(&RecordKey::Unconfigured).unwrap();
    assert!(second.id() > first.id());
    assert_eq!(greeting(&manager).as_deref(), Some("again"));
}

#[test]
fn test_provider_returning_during_disposal_recreates_configuration() {
    let harness = TestRuntime::new();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let descriptor = ComponentDescriptor::builder("door", || Ok(()))
        .reference(ReferenceDescriptor::new("greeter", GREETER))
        .on_deactivate(move |_: &(), _, _| {
            let _ = entered_tx.send(());
            let _ = release_rx
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(5));
            Ok(())
        })
        .build()
        .unwrap();
    let manager = harness.runtime.add_component(descriptor).unwrap();

    let first = register_greeter(&harness.registry, "first", 0);
    let disposed = manager.configuration(&RecordKey::Unconfigured).unwrap();
    assert_eq!(disposed.state(), ConfigurationState::Active);

    let unregistering = thread::spawn(move || first.unregister());
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // The old configuration is still deactivating when the replacement
    // provider arrives.
    let _second = register_greeter(&harness.registry, "second", 0);
    release_tx.send(()).unwrap();
    unregistering.join().unwrap().unwrap();

    assert_eq!(disposed.state(), ConfigurationState::Deactive);
    let replacement = manager
        .configuration(&RecordKey::Unconfigured)
        .expect("satisfied reference has a configuration");
    assert!(replacement.id() > disposed.id());
    assert_eq!(replacement.state(), ConfigurationState::Active);
    let bound = replacement.contexts()[0]
        .service::<Greeter>("greeter")
        .map(|g| g.name().to_string());
    assert_eq!(bound.as_deref(), Some("second"));
}

#[test]
fn test_ranking_ties_go_to_earliest_registration() {
    let harness = TestRuntime::new();
    let log = EventLog::new();
    let a = register_greeter(&harness.registry, "a", 5);
    let _b = register_greeter(&harness.registry, "b", 5);
    let _c = register_greeter(&harness.registry, "c", 3);
    let manager = door(&harness, &log, ReferenceDescriptor::new("greeter", GREETER));
    assert_eq!(greeting(&manager).as_deref(), Some("a"));

    let listener = manager
        .dependency("greeter")
        .unwrap()
        .listener_for(&RecordKey::Unconfigured)
        .unwrap();
    for _ in 0..10 {
        assert_eq!(listener.best().map(|p| p.id()), Some(a.id()));
    }
    let order: Vec<String> = listener
        .snapshot()
        .iter()
        .filter_map(|p| p.properties().get_str("name").map(str::to_string))
        .collect();
    assert_eq!(order, vec!["a", "b", "c"]);
}

#[test]
fn test_optional_multiple_reference_tracks_every_provider() {
    let harness = TestRuntime::new();
    let log = EventLog::new();
    let manager = door(
        &harness,
        &log,
        ReferenceDescriptor::new("greeter", GREETER)
            .cardinality(Cardinality::Multiple)
            .dynamic(),
    );
    let configuration = manager.configuration(&RecordKey::Unconfigured).unwrap();
    assert_eq!(configuration.state(), ConfigurationState::Active);

    let _one = register_greeter(&harness.registry, "one", 0);
    let two = register_greeter(&harness.registry, "two", 7);
    let names = || -> Vec<String> {
        configuration.contexts()[0]
            .services::<Greeter>("greeter")
            .iter()
            .map(|g| g.name().to_string())
            .collect()
    };
    assert_eq!(names(), vec!["two", "one"]);

    two.unregister().unwrap();
    assert_eq!(names(), vec!["one"]);
    assert_eq!(log.count(" activate"), 1);
}

#[test]
fn test_component_capability_is_activated_for_its_consumer() {
    let harness = TestRuntime::new();
    let log = EventLog::new();
    let provider = harness
        .runtime
        .add_component(
            recording_component("hello", &log)
                .provides(GREETER)
                .property("name", "hello")
                .build()
                .unwrap(),
        )
        .unwrap();
    let greeter = provider.configuration(&RecordKey::Unconfigured).unwrap();
    assert_eq!(greeter.state(), ConfigurationState::Registered);
    assert!(log.entries().is_empty());

    let consumer = door(&harness, &log, ReferenceDescriptor::new("greeter", GREETER));
    let door_id = consumer.configurations()[0].id();
    assert_eq!(greeter.state(), ConfigurationState::Active);
    assert_eq!(greeter.use_count(&ConsumerId::component(door_id)), 1);
    assert_eq!(
        log.entries(),
        vec![
            "door new",
            "hello new",
            "hello activate",
            "door bind greeter=hello",
            "door activate",
        ]
    );

    harness.runtime.disable("door").unwrap();
    assert_eq!(greeter.state(), ConfigurationState::Registered);
    assert_eq!(log.count("hello deactivate released"), 1);

    harness.runtime.disable("hello").unwrap();
    assert_eq!(harness.registry.provider_count(), 0);
}
