//! Convenience re-exports for tests.
//!
//! ```rust,ignore
//! use keel_test::prelude::*;
//! ```

pub use crate::fixtures::{
    GREETER, Greeter, greeter_properties, register_greeter, test_consumer, test_settings,
};
pub use crate::harness::{TestRuntime, eventually, init_logging, init_test_logging};
pub use crate::mocks::{EventLog, Recorder, record_bindings, record_modified, recording_component};
