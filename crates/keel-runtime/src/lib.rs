//! Keel Runtime - Component lifecycle and dynamic dependency binding.
//!
//! Given a [`ComponentDescriptor`] (its references to capabilities provided
//! by others, its own provided capability and its lifecycle hooks), the
//! runtime instantiates, wires and tears down live component
//! configurations as providers and configuration records come and go.
//!
//! This crate provides:
//! - Descriptors and their typed builder
//! - The per-configuration lifecycle state machine
//! - Reference listeners that track ranked providers for one filter
//! - Listener consolidation across diverging configuration records
//! - The component manager and runtime, plus an async configuration
//!   dispatcher
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use keel_config::{ConfigurationStore, RuntimeSettings};
//! use keel_core::Properties;
//! use keel_registry::ServiceRegistry;
//! use keel_runtime::prelude::*;
//!
//! struct Greeter;
//! struct Door;
//!
//! let registry = Arc::new(ServiceRegistry::new());
//! let runtime = ComponentRuntime::new(
//!     registry.clone(),
//!     Arc::new(ConfigurationStore::new()),
//!     &RuntimeSettings::default(),
//! );
//!
//! let door = ComponentDescriptor::builder("door", || Ok(Door))
//!     .reference(ReferenceDescriptor::new("greeter", "Greeter"))
//!     .build()
//!     .unwrap();
//! let manager = runtime.add_component(door).unwrap();
//! assert!(manager.configurations().is_empty());
//!
//! let _greeter = registry
//!     .register_object(&["Greeter"], Arc::new(Greeter), Properties::new())
//!     .unwrap();
//! assert_eq!(manager.configurations()[0].state(), ConfigurationState::Active);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

pub mod configuration;
pub mod context;
pub mod dependency;
pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod listener;
pub mod manager;
pub mod runtime;
pub mod state;

pub use configuration::{ComponentConfiguration, ConfigurationUpdate};
pub use context::{BoundProvider, ComponentContext};
pub use dependency::Dependency;
pub use descriptor::{
    ActivateHook, BindHook, Cardinality, ComponentBuilder, ComponentDescriptor,
    ConfigurationPolicy, DeactivateHook, Hook, Instance, InstanceFactory, Instancing,
    ModifiedHook, ReferenceDescriptor, ReferencePolicy,
};
pub use dispatcher::ConfigurationDispatcher;
pub use error::{ComponentError, ComponentResult};
pub use listener::ReferenceListener;
pub use manager::ComponentManager;
pub use runtime::ComponentRuntime;
pub use state::{ConfigurationState, DeactivationReason};
