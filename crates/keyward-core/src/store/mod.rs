//! Persistence layer
//!
//! Store traits used by the services, with two implementations:
//! - `PgStore`: PostgreSQL via SQLx, uniqueness enforced by indexes
//! - `MemoryStore`: process-local maps, used by tests and `STORE_BACKEND=memory`
//!
//! Uniqueness (account email, live reset request per email, role name) is a
//! store guarantee. Services never check-then-insert.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{ResetRequest, Role, UserAccount};

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found")]
    NotFound,

    /// Unique constraint violated; names the constrained field
    #[error("Unique constraint violated on {0}")]
    UniqueViolation(String),

    /// Conditional update lost against a concurrent writer
    #[error("Record version changed concurrently")]
    VersionConflict,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Account persistence
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Insert a new account; `UniqueViolation("email")` on a duplicate email
    async fn insert_account(&self, account: &UserAccount) -> StoreResult<()>;

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<UserAccount>>;

    /// Active account by (normalized) email
    async fn find_active_by_email(&self, email: &str) -> StoreResult<Option<UserAccount>>;

    /// Account holding this registration verification token
    async fn find_by_verification(&self, token: &str) -> StoreResult<Option<UserAccount>>;

    /// Account whose last issued access token matches
    async fn find_by_session(&self, email: &str, access_token: &str)
        -> StoreResult<Option<UserAccount>>;

    /// Account whose last issued refresh token matches
    async fn find_by_refresh_token(&self, refresh_token: &str)
        -> StoreResult<Option<UserAccount>>;

    async fn list_accounts(&self) -> StoreResult<Vec<UserAccount>>;

    async fn mark_verified(&self, id: Uuid) -> StoreResult<()>;

    /// Replace both session tokens
    async fn save_session(&self, id: Uuid, access_token: &str, refresh_token: &str)
        -> StoreResult<()>;

    async fn save_access_token(&self, id: Uuid, access_token: &str) -> StoreResult<()>;

    async fn update_password_hash(&self, id: Uuid, password_hash: &str) -> StoreResult<()>;

    /// Password update addressed by email, used by the recovery flow
    async fn update_password_hash_by_email(&self, email: &str, password_hash: &str)
        -> StoreResult<()>;

    async fn set_active(&self, id: Uuid, active: bool) -> StoreResult<()>;
}

/// Password reset persistence
#[async_trait]
pub trait ResetRequestStore: Send + Sync {
    /// Create a request; `UniqueViolation("email")` while a live one exists.
    ///
    /// An expired record for the same email is replaced.
    async fn create_reset(&self, request: &ResetRequest) -> StoreResult<ResetRequest>;

    async fn find_live_by_email(&self, email: &str, now: DateTime<Utc>)
        -> StoreResult<Option<ResetRequest>>;

    async fn find_live_by_key(&self, verification_key: &str, now: DateTime<Utc>)
        -> StoreResult<Option<ResetRequest>>;

    /// Compare-and-swap on `request.version`; returns the stored record with
    /// its bumped version, or `VersionConflict`.
    async fn update_reset(&self, request: &ResetRequest) -> StoreResult<ResetRequest>;
}

/// Role persistence
#[async_trait]
pub trait RoleStore: Send + Sync {
    /// Insert a role; `UniqueViolation("name")` on a duplicate name
    async fn create_role(&self, role: &Role) -> StoreResult<()>;

    async fn find_role(&self, name: &str) -> StoreResult<Option<Role>>;

    async fn list_roles(&self) -> StoreResult<Vec<Role>>;
}
