//! Keel Core - Foundation types and collaborator contracts for the Keel
//! component runtime.
//!
//! This crate provides:
//! - Property maps attached to providers and configuration records
//! - LDAP-style attribute filters used to select providers
//! - The provider ranking rule and a ranked provider set
//! - Identity types (provider, component, consumer, record key) and a
//!   monotonic sequence generator
//! - The [`CapabilityRegistry`] contract the runtime consumes
//!
//! # Example
//!
//! ```rust
//! use keel_core::{Filter, Properties};
//!
//! let filter = Filter::parse("(&(objectClass=Greeter)(service.ranking>=5))").unwrap();
//! let props = Properties::new()
//!     .with("objectClass", "Greeter")
//!     .with("service.ranking", 7);
//!
//! assert!(filter.matches(&props));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

pub mod error;
pub mod filter;
pub mod ids;
pub mod properties;
pub mod ranking;
pub mod registry;

pub use error::{FilterError, FilterResult, RegistryError, RegistryResult};
pub use filter::{Filter, MAX_FILTER_DEPTH};
pub use ids::{ComponentId, ConsumerId, ProviderId, RecordKey, Sequence, SubscriptionId};
pub use properties::{Properties, PropertyValue, keys};
pub use ranking::{ProviderRef, ProviderSet, RankingRule, SetDelta};
pub use registry::{
    CapabilityRegistry, ProviderFactory, ProviderSource, Registration, RegistryEvent,
    RegistryListener, ServiceObject,
};
