//! Identity types and the sequence generator behind them.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Registry-assigned provider identity. Lower ids were registered earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderId(pub u64);

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sequence id of one component configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentId(pub u64);

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token identifying one registry subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of whoever asks the registry for a provider instance.
///
/// Per-consumer components keep one instance per distinct consumer id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(Arc<str>);

impl ConsumerId {
    /// Create a consumer id from a name.
    #[must_use]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// The runtime itself, used when it activates immediate components.
    #[must_use]
    pub fn runtime() -> Self {
        Self::new("keel:runtime")
    }

    /// A component configuration acting as a consumer of its dependencies.
    #[must_use]
    pub fn component(id: ComponentId) -> Self {
        Self::new(format!("keel:component:{id}"))
    }

    /// The consumer name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of the configuration record a component configuration is bound to.
///
/// `Unconfigured` is the synthetic key used when no record applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKey {
    /// No configuration record.
    Unconfigured,
    /// A configuration record pid.
    Pid(String),
}

impl RecordKey {
    /// Key for a record pid.
    #[must_use]
    pub fn pid(pid: impl Into<String>) -> Self {
        Self::Pid(pid.into())
    }

    /// The pid, if this key names a record.
    #[must_use]
    pub fn as_pid(&self) -> Option<&str> {
        match self {
            Self::Unconfigured => None,
            Self::Pid(pid) => Some(pid),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unconfigured => f.write_str("<unconfigured>"),
            Self::Pid(pid) => f.write_str(pid),
        }
    }
}

/// Monotonic, process-wide sequence of ids.
///
/// Values are strictly increasing and never reused for the lifetime of the
/// generator.
#[derive(Debug)]
pub struct Sequence(AtomicU64);

impl Sequence {
    /// A sequence whose first value is `start`.
    #[must_use]
    pub const fn starting_at(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }

    /// Take the next value.
    pub fn next_value(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::starting_at(1)
    }
}
