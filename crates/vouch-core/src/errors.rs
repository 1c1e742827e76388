//! Core error types

use crate::identifiers::{EntityId, ModuleId, ServiceId};
use thiserror::Error;

/// Errors raised while encoding, decoding or dispatching actions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Payload bytes could not be decoded
    #[error("Malformed payload: {reason}")]
    Malformed {
        /// Decoder message
        reason: String,
    },

    /// No module is registered for the action's type tag
    #[error("Unknown action type: {module}")]
    UnknownType {
        /// Type tag carried by the action
        module: ModuleId,
    },

    /// The action's type is not served by the target service
    #[error("Module {module} is not part of service {service}")]
    UnauthorizedType {
        /// Type tag carried by the action
        module: ModuleId,
        /// Service the action was addressed to
        service: ServiceId,
    },

    /// The action targets an entity the decoding role does not act for
    #[error("Action for {actual} cannot be bound to a role of {expected}")]
    WrongEntity {
        /// Entity of the decoding role
        expected: EntityId,
        /// Entity named by the action
        actual: EntityId,
    },

    /// Serialization of an outgoing value failed
    #[error("Serialization failed: {reason}")]
    Serialization {
        /// Encoder message
        reason: String,
    },

    /// Configuration could not be read or is invalid
    #[error("Invalid configuration: {reason}")]
    Config {
        /// Description of the problem
        reason: String,
    },
}

impl CoreError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }

    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Malformed { .. } => "malformed",
            CoreError::UnknownType { .. } => "unknown_type",
            CoreError::UnauthorizedType { .. } => "unauthorized_type",
            CoreError::WrongEntity { .. } => "wrong_entity",
            CoreError::Serialization { .. } => "serialization",
            CoreError::Config { .. } => "config",
        }
    }
}

/// Result type for core operations
pub type CoreResult<T> = std::result::Result<T, CoreError>;
