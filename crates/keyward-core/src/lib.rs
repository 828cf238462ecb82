//! Keyward Core - Identity models, error kinds, and shared persistence
//!
//! This crate defines the building blocks shared by the keyward services:
//! - Account, role and password-reset records
//! - The finite error-kind vocabulary surfaced to callers
//! - Configuration management
//! - Credential, role and reset-request stores (PostgreSQL and in-memory)
//! - The line-delimited JSON command protocol

pub mod config;
pub mod messages;
pub mod models;
pub mod protocol;
pub mod store;

pub use config::{
    AppConfig, ConfigError, DatabaseConfig, JwtConfig, LoggingConfig, RecoveryConfig,
    ServerConfig, ServicesConfig, StoreBackend,
};
pub use models::{
    minutes_rounded_up, normalize_email, AccessToken, AccountPublic, LocationMetadata,
    ResetRequest, ResetState, Role, RoleRef, TokenPair, TransitionError, UserAccount, ROLE_ADMIN,
    ROLE_GUEST, ROLE_MEMBER,
};
pub use protocol::{Reply, ReplyFrame, RequestFrame};
pub use store::{
    CredentialStore, MemoryStore, PgStore, ResetRequestStore, RoleStore, StoreError, StoreResult,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Discriminator carried by every failure reply.
///
/// Clients branch on this value; the accompanying message is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    BadRequest,
    Unauthorized,
    DownstreamUnavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::BadRequest => "BAD_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::DownstreamUnavailable => "DOWNSTREAM_UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by every identity operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Downstream unavailable: {0}")]
    DownstreamUnavailable(String),

    /// Genuine faults (storage, hashing, signing). Details stay in logs.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IdentityError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn downstream(message: impl Into<String>) -> Self {
        Self::DownstreamUnavailable(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::DownstreamUnavailable(_) => ErrorKind::DownstreamUnavailable,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Message safe to hand back to a caller.
    ///
    /// Internal faults are replaced by a fixed string.
    pub fn public_message(&self) -> &str {
        match self {
            Self::NotFound(msg)
            | Self::Conflict(msg)
            | Self::BadRequest(msg)
            | Self::Unauthorized(msg)
            | Self::DownstreamUnavailable(msg) => msg,
            Self::Internal(_) => messages::INTERNAL_ERROR,
        }
    }
}

impl From<StoreError> for IdentityError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => IdentityError::NotFound(messages::RECORD_NOT_FOUND.to_string()),
            StoreError::UniqueViolation(what) => {
                IdentityError::Conflict(format!("{what} already exists"))
            }
            StoreError::VersionConflict => {
                IdentityError::Conflict(messages::CONCURRENT_MODIFICATION.to_string())
            }
            StoreError::Database(msg) => IdentityError::Internal(msg),
            StoreError::Serialization(err) => IdentityError::Internal(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, IdentityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::DownstreamUnavailable).unwrap(),
            "\"DOWNSTREAM_UNAVAILABLE\""
        );
        assert_eq!(ErrorKind::BadRequest.to_string(), "BAD_REQUEST");
    }

    #[test]
    fn test_internal_message_is_hidden() {
        let err = IdentityError::internal("connection reset by peer at 10.0.0.3");
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.public_message(), messages::INTERNAL_ERROR);

        let err = IdentityError::bad_request("Passwords do not match");
        assert_eq!(err.public_message(), "Passwords do not match");
    }

    #[test]
    fn test_store_error_mapping() {
        let err: IdentityError = StoreError::UniqueViolation("email".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err: IdentityError = StoreError::VersionConflict.into();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err: IdentityError = StoreError::Database("boom".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
