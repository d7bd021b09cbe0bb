//! Keel Test - Shared test utilities for the Keel component runtime.
//!
//! Recording components, provider fixtures and a wired-up runtime harness,
//! used across the Keel crates as a dev-dependency.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! keel-test.workspace = true
//! ```
//!
//! ```rust,ignore
//! use keel_test::{EventLog, TestRuntime, recording_component, register_greeter};
//! use keel_runtime::ReferenceDescriptor;
//!
//! #[test]
//! fn test_binds_greeter() {
//!     let harness = TestRuntime::new();
//!     let log = EventLog::new();
//!     let _greeter = register_greeter(&harness.registry, "hello", 0);
//!
//!     let descriptor = recording_component("door", &log)
//!         .reference(ReferenceDescriptor::new("greeter", keel_test::GREETER))
//!         .build()
//!         .unwrap();
//!     harness.runtime.add_component(descriptor).unwrap();
//!
//!     assert_eq!(log.entries(), vec!["door new", "door activate"]);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

pub mod fixtures;
pub mod harness;
pub mod mocks;

pub use fixtures::*;
pub use harness::*;
pub use mocks::*;
