//! Commonly used types, re-exported for glob import.
//!
//! ```rust
//! use keel_core::prelude::*;
//! ```

pub use crate::{
    CapabilityRegistry, ComponentId, ConsumerId, Filter, Properties, PropertyValue, ProviderId,
    ProviderRef, ProviderSet, RankingRule, RecordKey, Registration, RegistryError, RegistryEvent,
    RegistryListener, RegistryResult, ServiceObject,
};
