//! Component runtime error types.

use keel_core::RegistryError;
use thiserror::Error;

/// Errors raised by component lifecycle operations.
///
/// `Clone` so that one activation outcome can be handed to every thread
/// waiting on the same context.
#[derive(Debug, Clone, Error)]
pub enum ComponentError {
    /// The implementation factory failed.
    #[error("component {component}: instantiation failed: {message}")]
    Instantiation {
        /// Component name.
        component: String,
        /// The factory's error.
        message: String,
    },

    /// A mandatory reference had no provider to bind.
    #[error("component {component}: mandatory reference '{reference}' has no provider")]
    UnsatisfiedReference {
        /// Component name.
        component: String,
        /// Reference name.
        reference: String,
    },

    /// An activation waited too long for an in-progress deactivation.
    #[error("component {component}: timed out after {timeout_ms} ms waiting for deactivation")]
    DeactivationTimeout {
        /// Component name.
        component: String,
        /// The configured bound.
        timeout_ms: u64,
    },

    /// A user lifecycle hook failed.
    #[error("component {component}: {hook} hook failed: {message}")]
    Hook {
        /// Component name.
        component: String,
        /// Which hook (`activate`, `bind:<reference>`, ...).
        hook: String,
        /// The hook's error.
        message: String,
    },

    /// Activation failed; wraps the instantiation, binding or hook failure.
    #[error("component {component}: activation failed: {source}")]
    ActivationFailed {
        /// Component name.
        component: String,
        /// The underlying failure.
        #[source]
        source: Box<ComponentError>,
    },

    /// The configuration has been disposed.
    #[error("component {component}: configuration {id} is disposed")]
    Disposed {
        /// Component name.
        component: String,
        /// Configuration id.
        id: u64,
    },

    /// A descriptor was rejected at registration.
    #[error("invalid component descriptor: {0}")]
    InvalidDescriptor(String),

    /// No component with this name is registered.
    #[error("component not found: {0}")]
    NotFound(String),

    /// A component with this name is already registered.
    #[error("component already registered: {0}")]
    AlreadyRegistered(String),

    /// The capability registry refused an operation.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ComponentError {
    /// Whether this is (or wraps) a deactivation timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::DeactivationTimeout { .. } => true,
            Self::ActivationFailed { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}

/// Result type for component operations.
pub type ComponentResult<T> = Result<T, ComponentError>;
