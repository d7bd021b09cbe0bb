//! Error types shared by the runtime and its collaborators.

use thiserror::Error;

use crate::ids::ProviderId;

/// A filter string could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid filter at offset {offset}: {message}")]
pub struct FilterError {
    /// Byte offset into the filter text where parsing stopped.
    pub offset: usize,
    /// What was expected or found.
    pub message: String,
}

impl FilterError {
    pub(crate) fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

/// Result type for filter parsing.
pub type FilterResult<T> = Result<T, FilterError>;

/// Errors reported by a capability registry.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// No provider with this id is registered.
    #[error("provider not found: {0}")]
    NotFound(ProviderId),

    /// The registration was already withdrawn.
    #[error("provider already unregistered: {0}")]
    AlreadyUnregistered(ProviderId),

    /// A factory-style provider failed to produce an instance.
    #[error("provider {provider} failed to produce an instance: {message}")]
    Factory {
        /// The provider whose factory failed.
        provider: ProviderId,
        /// The factory's error message.
        message: String,
    },

    /// The registration request itself was malformed.
    #[error("invalid registration: {0}")]
    InvalidRegistration(String),
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
