//! PostgreSQL store
//!
//! Accounts, roles and reset requests backed by SQLx. Uniqueness comes from
//! the indexes in `migrations/`; unique violations are mapped to
//! `StoreError::UniqueViolation`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgQueryResult};
use sqlx::types::Json;
use sqlx::FromRow;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{CredentialStore, ResetRequestStore, RoleStore, StoreError, StoreResult};
use crate::models::{normalize_email, ResetRequest, Role, RoleRef, UserAccount};

/// PostgreSQL-backed implementation of every store trait
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Open a connection pool
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Database(format!("PostgreSQL connection failed: {e}")))?;

        info!(max_connections, "PostgreSQL pool ready");
        Ok(Self { pool })
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        debug!("Schema migrations applied");
        Ok(())
    }
}

/// Single-row update outcome; zero affected rows means the record is gone
fn expect_updated(
    result: std::result::Result<PgQueryResult, sqlx::Error>,
    what: &str,
) -> StoreResult<()> {
    let result = result.map_err(|e| db_error(what, e))?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound);
    }
    Ok(())
}

/// Map a SQLx error, surfacing unique violations on `field`
fn write_error(field: &str, what: &str, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            StoreError::UniqueViolation(field.to_string())
        }
        _ => db_error(what, err),
    }
}

fn db_error(what: &str, err: sqlx::Error) -> StoreError {
    error!(operation = what, error = %err, "Database operation failed");
    StoreError::Database(format!("Failed to {what}: {err}"))
}

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, FromRow)]
struct AccountRow {
    id: Uuid,
    email: String,
    password_hash: String,
    roles: Json<Vec<RoleRef>>,
    permissions: String,
    active: bool,
    is_verify: bool,
    verification: Option<String>,
    ban: bool,
    ban_reason: Option<String>,
    access_token: Option<String>,
    refresh_token: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AccountRow> for UserAccount {
    fn from(row: AccountRow) -> Self {
        UserAccount {
            id: row.id,
            email: row.email,
            password_hash: row.password_hash,
            roles: row.roles.0,
            permissions: row.permissions,
            active: row.active,
            is_verify: row.is_verify,
            verification: row.verification,
            ban: row.ban,
            ban_reason: row.ban_reason,
            access_token: row.access_token,
            refresh_token: row.refresh_token,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const ACCOUNT_COLUMNS: &str = "id, email, password_hash, roles, permissions, active, is_verify, \
     verification, ban, ban_reason, access_token, refresh_token, created_at, updated_at";

#[derive(Debug, FromRow)]
struct ResetRow {
    email: String,
    verification_key: String,
    step_verification: bool,
    step_reset: bool,
    location: Json<BTreeMap<String, serde_json::Value>>,
    refresh_date: Option<DateTime<Utc>>,
    send_attempts: i32,
    timeout_minutes: i32,
    version: i64,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl From<ResetRow> for ResetRequest {
    fn from(row: ResetRow) -> Self {
        ResetRequest {
            email: row.email,
            verification_key: row.verification_key,
            step_verification: row.step_verification,
            step_reset: row.step_reset,
            location: row.location.0,
            refresh_date: row.refresh_date,
            send_attempts: row.send_attempts.max(0) as u32,
            timeout_minutes: row.timeout_minutes.max(0) as u32,
            version: row.version,
            created_at: row.created_at,
            expires_at: row.expires_at,
        }
    }
}

const RESET_COLUMNS: &str = "email, verification_key, step_verification, step_reset, location, \
     refresh_date, send_attempts, timeout_minutes, version, created_at, expires_at";

#[derive(Debug, FromRow)]
struct RoleRow {
    id: Uuid,
    name: String,
    permissions: String,
    created_at: DateTime<Utc>,
}

impl From<RoleRow> for Role {
    fn from(row: RoleRow) -> Self {
        Role {
            id: row.id,
            name: row.name,
            permissions: row.permissions,
            created_at: row.created_at,
        }
    }
}

// ============================================================================
// Accounts
// ============================================================================

#[async_trait]
impl CredentialStore for PgStore {
    async fn insert_account(&self, account: &UserAccount) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (
                id, email, password_hash, roles, permissions,
                active, is_verify, verification, ban, ban_reason,
                access_token, refresh_token, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(account.id)
        .bind(normalize_email(&account.email))
        .bind(&account.password_hash)
        .bind(Json(&account.roles))
        .bind(&account.permissions)
        .bind(account.active)
        .bind(account.is_verify)
        .bind(&account.verification)
        .bind(account.ban)
        .bind(&account.ban_reason)
        .bind(&account.access_token)
        .bind(&account.refresh_token)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("email", "create user", e))?;

        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<UserAccount>> {
        let row: Option<AccountRow> =
            sqlx::query_as(&format!("SELECT {ACCOUNT_COLUMNS} FROM users WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| db_error("get user", e))?;

        Ok(row.map(UserAccount::from))
    }

    async fn find_active_by_email(&self, email: &str) -> StoreResult<Option<UserAccount>> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM users WHERE LOWER(email) = $1 AND active = TRUE"
        ))
        .bind(normalize_email(email))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get user by email", e))?;

        Ok(row.map(UserAccount::from))
    }

    async fn find_by_verification(&self, token: &str) -> StoreResult<Option<UserAccount>> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM users WHERE verification = $1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get user by verification token", e))?;

        Ok(row.map(UserAccount::from))
    }

    async fn find_by_session(
        &self,
        email: &str,
        access_token: &str,
    ) -> StoreResult<Option<UserAccount>> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM users WHERE LOWER(email) = $1 AND access_token = $2"
        ))
        .bind(normalize_email(email))
        .bind(access_token)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get user by session", e))?;

        Ok(row.map(UserAccount::from))
    }

    async fn find_by_refresh_token(
        &self,
        refresh_token: &str,
    ) -> StoreResult<Option<UserAccount>> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM users WHERE refresh_token = $1"
        ))
        .bind(refresh_token)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get user by refresh token", e))?;

        Ok(row.map(UserAccount::from))
    }

    async fn list_accounts(&self) -> StoreResult<Vec<UserAccount>> {
        let rows: Vec<AccountRow> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM users ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list users", e))?;

        Ok(rows.into_iter().map(UserAccount::from).collect())
    }

    async fn mark_verified(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE users SET is_verify = TRUE, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await;

        expect_updated(result, "verify user")
    }

    async fn save_session(
        &self,
        id: Uuid,
        access_token: &str,
        refresh_token: &str,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE users SET access_token = $2, refresh_token = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(access_token)
        .bind(refresh_token)
        .execute(&self.pool)
        .await;

        expect_updated(result, "store session")
    }

    async fn save_access_token(&self, id: Uuid, access_token: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE users SET access_token = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(access_token)
        .execute(&self.pool)
        .await;

        expect_updated(result, "store access token")
    }

    async fn update_password_hash(&self, id: Uuid, password_hash: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(password_hash)
        .execute(&self.pool)
        .await;

        expect_updated(result, "update password")
    }

    async fn update_password_hash_by_email(
        &self,
        email: &str,
        password_hash: &str,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE users SET password_hash = $2, updated_at = NOW() WHERE LOWER(email) = $1",
        )
        .bind(normalize_email(email))
        .bind(password_hash)
        .execute(&self.pool)
        .await;

        expect_updated(result, "update password")
    }

    async fn set_active(&self, id: Uuid, active: bool) -> StoreResult<()> {
        let result = sqlx::query("UPDATE users SET active = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(&self.pool)
            .await;

        expect_updated(result, "update user status")
    }
}

// ============================================================================
// Reset requests
// ============================================================================

#[async_trait]
impl ResetRequestStore for PgStore {
    async fn create_reset(&self, request: &ResetRequest) -> StoreResult<ResetRequest> {
        // An existing row is only overwritten once it has expired; a live row
        // makes the conditional upsert return nothing. The replacement keeps
        // counting versions so stale writes against the old row still fail.
        let row: Option<ResetRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO reset_requests ({RESET_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9, $10)
            ON CONFLICT (email) DO UPDATE SET
                verification_key = EXCLUDED.verification_key,
                step_verification = EXCLUDED.step_verification,
                step_reset = EXCLUDED.step_reset,
                location = EXCLUDED.location,
                refresh_date = EXCLUDED.refresh_date,
                send_attempts = EXCLUDED.send_attempts,
                timeout_minutes = EXCLUDED.timeout_minutes,
                version = reset_requests.version + 1,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            WHERE reset_requests.expires_at <= EXCLUDED.created_at
            RETURNING {RESET_COLUMNS}
            "#
        ))
        .bind(normalize_email(&request.email))
        .bind(&request.verification_key)
        .bind(request.step_verification)
        .bind(request.step_reset)
        .bind(Json(&request.location))
        .bind(request.refresh_date)
        .bind(request.send_attempts as i32)
        .bind(request.timeout_minutes as i32)
        .bind(request.created_at)
        .bind(request.expires_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| write_error("email", "create reset request", e))?;

        row.map(ResetRequest::from)
            .ok_or_else(|| StoreError::UniqueViolation("email".to_string()))
    }

    async fn find_live_by_email(
        &self,
        email: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ResetRequest>> {
        let row: Option<ResetRow> = sqlx::query_as(&format!(
            "SELECT {RESET_COLUMNS} FROM reset_requests WHERE email = $1 AND expires_at > $2"
        ))
        .bind(normalize_email(email))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get reset request", e))?;

        Ok(row.map(ResetRequest::from))
    }

    async fn find_live_by_key(
        &self,
        verification_key: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ResetRequest>> {
        let row: Option<ResetRow> = sqlx::query_as(&format!(
            "SELECT {RESET_COLUMNS} FROM reset_requests \
             WHERE verification_key = $1 AND expires_at > $2"
        ))
        .bind(verification_key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get reset request by key", e))?;

        Ok(row.map(ResetRequest::from))
    }

    async fn update_reset(&self, request: &ResetRequest) -> StoreResult<ResetRequest> {
        let row: Option<ResetRow> = sqlx::query_as(&format!(
            r#"
            UPDATE reset_requests SET
                verification_key = $3,
                step_verification = $4,
                step_reset = $5,
                location = $6,
                refresh_date = $7,
                send_attempts = $8,
                timeout_minutes = $9,
                version = version + 1
            WHERE email = $1 AND version = $2
            RETURNING {RESET_COLUMNS}
            "#
        ))
        .bind(normalize_email(&request.email))
        .bind(request.version)
        .bind(&request.verification_key)
        .bind(request.step_verification)
        .bind(request.step_reset)
        .bind(Json(&request.location))
        .bind(request.refresh_date)
        .bind(request.send_attempts as i32)
        .bind(request.timeout_minutes as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("update reset request", e))?;

        if let Some(row) = row {
            return Ok(row.into());
        }

        let exists: (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM reset_requests WHERE email = $1)")
                .bind(normalize_email(&request.email))
                .fetch_one(&self.pool)
                .await
                .map_err(|e| db_error("check reset request", e))?;

        if exists.0 {
            Err(StoreError::VersionConflict)
        } else {
            Err(StoreError::NotFound)
        }
    }
}

// ============================================================================
// Roles
// ============================================================================

#[async_trait]
impl RoleStore for PgStore {
    async fn create_role(&self, role: &Role) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO roles (id, name, permissions, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(role.id)
        .bind(&role.name)
        .bind(&role.permissions)
        .bind(role.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("name", "create role", e))?;

        Ok(())
    }

    async fn find_role(&self, name: &str) -> StoreResult<Option<Role>> {
        let row: Option<RoleRow> = sqlx::query_as(
            "SELECT id, name, permissions, created_at FROM roles WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get role", e))?;

        Ok(row.map(Role::from))
    }

    async fn list_roles(&self) -> StoreResult<Vec<Role>> {
        let rows: Vec<RoleRow> = sqlx::query_as(
            "SELECT id, name, permissions, created_at FROM roles ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list roles", e))?;

        Ok(rows.into_iter().map(Role::from).collect())
    }
}
