//! Lifecycle states and deactivation reasons.

use std::fmt;

/// Lifecycle state of one component configuration.
///
/// `Activating → Registered → Active → Deactivating → Deactive`.
/// `Registered` is skipped when the component provides no capability.
/// `Deactive` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigurationState {
    /// Created; no capability registered and no live instance.
    Activating,
    /// Capability registered; instances are created on first use.
    Registered,
    /// At least one live instance.
    Active,
    /// Disposal in progress.
    Deactivating,
    /// Disposed.
    Deactive,
}

impl ConfigurationState {
    /// Whether the configuration reached its terminal state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Deactive
    }
}

impl fmt::Display for ConfigurationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Activating => "activating",
            Self::Registered => "registered",
            Self::Active => "active",
            Self::Deactivating => "deactivating",
            Self::Deactive => "deactive",
        })
    }
}

/// Why an instance is being deactivated. Passed to the deactivate hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeactivationReason {
    /// The component was disabled or removed from the runtime.
    Disabled,
    /// The configuration record was deleted.
    ConfigurationDeleted,
    /// The configuration record changed and the component has no modified
    /// hook.
    ConfigurationModified,
    /// A mandatory reference lost its last provider.
    ReferenceUnsatisfied,
    /// A static reference's bound providers changed.
    ReferenceRebind,
    /// The last consumer released the instance.
    Released,
    /// Explicit disposal.
    Disposed,
}

impl fmt::Display for DeactivationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disabled => "disabled",
            Self::ConfigurationDeleted => "configuration deleted",
            Self::ConfigurationModified => "configuration modified",
            Self::ReferenceUnsatisfied => "reference unsatisfied",
            Self::ReferenceRebind => "reference rebind",
            Self::Released => "released",
            Self::Disposed => "disposed",
        })
    }
}
