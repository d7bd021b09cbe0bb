//! Keel Registry - In-memory capability registry.
//!
//! The component runtime treats the registry as a collaborator and only
//! talks to it through [`keel_core::CapabilityRegistry`]. This crate provides
//! the in-process implementation used by the runtime's tests and by hosts
//! that do not bring their own registry.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use keel_core::{CapabilityRegistry, ConsumerId, Filter, Properties};
//! use keel_registry::ServiceRegistry;
//!
//! let registry = ServiceRegistry::new();
//! registry
//!     .register_object(&["Greeter"], Arc::new("hello".to_string()), Properties::new())
//!     .unwrap();
//!
//! let matches = registry.current_matches(&Filter::object_class("Greeter"));
//! let object = registry.get(&matches[0], &ConsumerId::new("doc")).unwrap();
//! assert_eq!(object.downcast_ref::<String>().unwrap(), "hello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod registry;

pub use registry::{ServiceRegistration, ServiceRegistry};
