//! Commonly used types, re-exported for glob import.
//!
//! ```rust
//! use keel_runtime::prelude::*;
//! ```

pub use crate::{
    BoundProvider, Cardinality, ComponentConfiguration, ComponentContext, ComponentDescriptor,
    ComponentError, ComponentManager, ComponentResult, ComponentRuntime, ConfigurationPolicy,
    ConfigurationState, DeactivationReason, Instancing, ReferenceDescriptor, ReferencePolicy,
};
