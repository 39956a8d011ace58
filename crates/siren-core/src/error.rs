//! Unified error types for the siren core library.
//!
//! [`SirenError`] covers every failure mode of the pairing and alerting
//! service. Configuration has its own [`ConfigError`](crate::config::ConfigError)
//! which converts into the unified type.
//!
//! Every variant belongs to exactly one [`ErrorKind`], the machine-readable
//! taxonomy surfaced to API callers:
//!
//! | Kind                   | HTTP |
//! |------------------------|------|
//! | `not_found`            | 404  |
//! | `expired`              | 410  |
//! | `conflict`             | 409  |
//! | `validation_error`     | 400  |
//! | `upstream_unavailable` | 503  |
//! | `internal`             | 500  |
//!
//! # Example
//!
//! ```rust
//! use siren_core::error::{ErrorKind, SirenError};
//!
//! let err = SirenError::CodeExpired("483920".into());
//! assert_eq!(err.kind(), ErrorKind::Expired);
//! assert_eq!(err.http_status_code(), 410);
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown device, code, relationship or alert.
    NotFound,
    /// Code past its TTL (or cancelled before it).
    Expired,
    /// Device claimed by another owner, code already consumed, duplicate contact.
    Conflict,
    /// Malformed or semantically invalid input.
    ValidationError,
    /// Push gateway unreachable after the retry budget was spent.
    UpstreamUnavailable,
    /// Server-side failure (storage, configuration).
    Internal,
}

impl ErrorKind {
    /// Wire representation of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::Conflict => "conflict",
            Self::ValidationError => "validation_error",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unified error type for all siren operations.
#[derive(Debug, Error)]
pub enum SirenError {
    // =========================================================================
    // DEVICE REGISTRY ERRORS
    // =========================================================================
    /// No device with this identifier has ever been registered.
    #[error("Device not found: '{0}'")]
    DeviceNotFound(String),

    /// The device exists but is not currently registered to an owner.
    #[error("Device '{0}' is not registered. Register the device before issuing codes.")]
    DeviceNotRegistered(String),

    /// The device is registered to a different owner.
    #[error("Device '{device_id}' is already claimed by another owner. The current owner must deregister it first.")]
    DeviceAlreadyClaimed {
        /// The contested device.
        device_id: String,
    },

    /// The caller's user id does not match the device's owner.
    #[error("User '{user_id}' does not own device '{device_id}'")]
    OwnerMismatch {
        /// The device being acted upon.
        device_id: String,
        /// The user id supplied by the caller.
        user_id: String,
    },

    // =========================================================================
    // CODE STORE ERRORS
    // =========================================================================
    /// No code with this value exists.
    #[error("Authentication code not found")]
    CodeNotFound(String),

    /// The code's ten-minute window has passed.
    #[error("Authentication code has expired. Ask the owner to generate a new code.")]
    CodeExpired(String),

    /// The owner cancelled the code before it was redeemed.
    #[error("Authentication code was cancelled by its owner")]
    CodeCancelled(String),

    /// The code has already been redeemed once.
    #[error("Authentication code has already been used")]
    CodeAlreadyConsumed(String),

    /// No unused code value could be drawn.
    #[error("Could not allocate a unique authentication code after {attempts} attempts")]
    CodeSpaceExhausted {
        /// How many candidates were drawn.
        attempts: u32,
    },

    // =========================================================================
    // RELATIONSHIP & ALERT ERRORS
    // =========================================================================
    /// No relationship with this id exists for the owner.
    #[error("Emergency contact not found: '{0}'")]
    RelationshipNotFound(String),

    /// The owner already has this contact and duplicates are disabled.
    #[error("'{contact}' is already an emergency contact of '{owner_user_id}'")]
    DuplicateRelationship {
        /// Owner of the relationship.
        owner_user_id: String,
        /// Identifier of the duplicate contact (device id or name).
        contact: String,
    },

    /// No alert event with this id exists.
    #[error("Alert not found: '{0}'")]
    AlertNotFound(String),

    // =========================================================================
    // INPUT & UPSTREAM ERRORS
    // =========================================================================
    /// A request field failed validation.
    #[error("Invalid {field}: {message}")]
    Validation {
        /// Name of the offending field.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// The push gateway could not be reached.
    #[error("Push gateway unavailable: {0}")]
    UpstreamUnavailable(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// An error occurred while persisting or reading data.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// Stored data could not be (de)serialised.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for siren operations.
pub type Result<T> = std::result::Result<T, SirenError>;

impl SirenError {
    /// Shorthand for a [`SirenError::Validation`].
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    /// The taxonomy category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceNotFound(_)
            | Self::CodeNotFound(_)
            | Self::RelationshipNotFound(_)
            | Self::AlertNotFound(_) => ErrorKind::NotFound,

            Self::CodeExpired(_) | Self::CodeCancelled(_) => ErrorKind::Expired,

            Self::DeviceAlreadyClaimed { .. }
            | Self::OwnerMismatch { .. }
            | Self::CodeAlreadyConsumed(_)
            | Self::DuplicateRelationship { .. } => ErrorKind::Conflict,

            // Issuing against an unregistered device is a caller mistake.
            Self::DeviceNotRegistered(_) | Self::Validation { .. } => ErrorKind::ValidationError,

            Self::UpstreamUnavailable(_) | Self::CodeSpaceExhausted { .. } => {
                ErrorKind::UpstreamUnavailable
            }

            Self::ConfigNotFound(_)
            | Self::ConfigParseError(_)
            | Self::ConfigValidationError(_)
            | Self::PersistenceError(_)
            | Self::SerializationError(_)
            | Self::IoError(_) => ErrorKind::Internal,
        }
    }

    /// Returns `true` if this error concerns an authentication code.
    #[inline]
    #[must_use]
    pub const fn is_code_error(&self) -> bool {
        matches!(
            self,
            Self::CodeNotFound(_)
                | Self::CodeExpired(_)
                | Self::CodeCancelled(_)
                | Self::CodeAlreadyConsumed(_)
                | Self::CodeSpaceExhausted { .. }
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is related to I/O or persistence.
    #[inline]
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(
            self,
            Self::PersistenceError(_) | Self::SerializationError(_) | Self::IoError(_)
        )
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::ValidationError => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Expired => 410,
            ErrorKind::Internal => 500,
            ErrorKind::UpstreamUnavailable => 503,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            Self::DeviceNotRegistered(_) => "DEVICE_NOT_REGISTERED",
            Self::DeviceAlreadyClaimed { .. } => "DEVICE_ALREADY_CLAIMED",
            Self::OwnerMismatch { .. } => "OWNER_MISMATCH",
            Self::CodeNotFound(_) => "CODE_NOT_FOUND",
            Self::CodeExpired(_) => "CODE_EXPIRED",
            Self::CodeCancelled(_) => "CODE_CANCELLED",
            Self::CodeAlreadyConsumed(_) => "CODE_ALREADY_CONSUMED",
            Self::CodeSpaceExhausted { .. } => "CODE_SPACE_EXHAUSTED",
            Self::RelationshipNotFound(_) => "RELATIONSHIP_NOT_FOUND",
            Self::DuplicateRelationship { .. } => "DUPLICATE_RELATIONSHIP",
            Self::AlertNotFound(_) => "ALERT_NOT_FOUND",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::SerializationError(_) => "SERIALIZATION_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for SirenError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::LoadError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::WriteError { path, source } => {
                Self::PersistenceError(format!("Failed to write {}: {source}", path.display()))
            }
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
