//! Identity records
//!
//! - UserAccount: credentials, roles, status flags and session material
//! - Role: named permission set assigned at registration
//! - ResetRequest: per-email password recovery progress
//! - TokenPair / AccessToken: transient token values handed back to callers

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

pub const ROLE_ADMIN: &str = "Admin";
pub const ROLE_MEMBER: &str = "Member";
pub const ROLE_GUEST: &str = "Guest";

/// Free-form origin data attached to a reset request (IP, city, user agent...)
pub type LocationMetadata = serde_json::Map<String, serde_json::Value>;

/// Canonical form of an email address.
///
/// Uniqueness is case-insensitive, so every store key goes through here.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

// ============================================================================
// Roles
// ============================================================================

/// Role reference embedded in an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
}

impl RoleRef {
    pub fn new(name: impl Into<String>, permissions: Option<String>) -> Self {
        Self {
            name: name.into(),
            permissions,
        }
    }
}

/// Role record (unique by name)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub permissions: String,
    pub created_at: DateTime<Utc>,
}

impl Role {
    pub fn new(name: impl Into<String>, permissions: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            permissions: permissions.into(),
            created_at: Utc::now(),
        }
    }

    pub fn to_ref(&self) -> RoleRef {
        RoleRef::new(self.name.clone(), Some(self.permissions.clone()))
    }
}

// ============================================================================
// Accounts
// ============================================================================

/// User account record
///
/// `password_hash` always holds an Argon2 PHC string; raw passwords never
/// cross the service boundary into a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: Uuid,

    /// Normalized (lowercase) email, unique
    pub email: String,

    #[serde(skip_serializing)]
    pub password_hash: String,

    pub roles: Vec<RoleRef>,

    /// Dashboard permission name, "Guest" unless a role was assigned
    pub permissions: String,

    /// Soft-delete / archive toggle
    pub active: bool,

    /// Email confirmed through the registration link
    pub is_verify: bool,

    /// Registration verification token
    pub verification: Option<String>,

    pub ban: bool,
    pub ban_reason: Option<String>,

    /// Last issued access token
    pub access_token: Option<String>,

    /// Last issued refresh token
    pub refresh_token: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserAccount {
    /// Create a fresh, unverified account holding a single role
    pub fn new(email: &str, password_hash: String, role: RoleRef) -> Self {
        let now = Utc::now();
        let permissions = role.name.clone();
        Self {
            id: Uuid::new_v4(),
            email: normalize_email(email),
            password_hash,
            roles: vec![role],
            permissions,
            active: true,
            is_verify: false,
            verification: None,
            ban: false,
            ban_reason: None,
            access_token: None,
            refresh_token: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_verification(mut self, token: String) -> Self {
        self.verification = Some(token);
        self
    }

    /// Role names embedded into session claims
    pub fn role_names(&self) -> Vec<String> {
        self.roles.iter().map(|r| r.name.clone()).collect()
    }

    /// Public representation, without hash or tokens
    pub fn to_public(&self) -> AccountPublic {
        AccountPublic {
            id: self.id,
            email: self.email.clone(),
            roles: self.roles.clone(),
            permissions: self.permissions.clone(),
            active: self.active,
            is_verify: self.is_verify,
            ban: self.ban,
            ban_reason: self.ban_reason.clone(),
            created_at: self.created_at,
        }
    }
}

/// Account view safe to return to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountPublic {
    pub id: Uuid,
    pub email: String,
    pub roles: Vec<RoleRef>,
    pub permissions: String,
    pub active: bool,
    pub is_verify: bool,
    pub ban: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ban_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Tokens
// ============================================================================

/// Access + refresh tokens issued at login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

/// Access token minted from a refresh token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub access: String,
}

// ============================================================================
// Password recovery
// ============================================================================

/// Position of a reset request in the recovery flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResetState {
    New,
    Verified,
    Reset,
}

/// Rejected state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("reset link already verified")]
    AlreadyVerified,

    #[error("password already reset")]
    AlreadyReset,

    #[error("reset link not verified yet")]
    NotVerified,
}

/// In-flight password reset, one live record per email
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetRequest {
    /// Normalized email, store key
    pub email: String,

    /// Signed reset token mailed to the user
    pub verification_key: String,

    pub step_verification: bool,

    /// Terminal once true
    pub step_reset: bool,

    /// Origin metadata keyed by unix-millis timestamp
    pub location: BTreeMap<String, serde_json::Value>,

    /// Earliest time the next resend is allowed
    pub refresh_date: Option<DateTime<Utc>>,

    pub send_attempts: u32,

    /// Minutes added to `refresh_date` on the next resend
    pub timeout_minutes: u32,

    /// Optimistic concurrency token, bumped by every store update
    pub version: i64,

    pub created_at: DateTime<Utc>,

    /// `created_at` plus the retention window, regardless of progress
    pub expires_at: DateTime<Utc>,
}

impl ResetRequest {
    pub fn new(
        email: &str,
        verification_key: String,
        now: DateTime<Utc>,
        retention: Duration,
        initial_timeout_minutes: u32,
    ) -> Self {
        Self {
            email: normalize_email(email),
            verification_key,
            step_verification: false,
            step_reset: false,
            location: BTreeMap::new(),
            refresh_date: None,
            send_attempts: 0,
            timeout_minutes: initial_timeout_minutes,
            version: 0,
            created_at: now,
            expires_at: now + retention,
        }
    }

    /// Record where the request came from
    pub fn record_origin(&mut self, at: DateTime<Utc>, origin: LocationMetadata) {
        self.location.insert(
            at.timestamp_millis().to_string(),
            serde_json::Value::Object(origin),
        );
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn state(&self) -> ResetState {
        if self.step_reset {
            ResetState::Reset
        } else if self.step_verification {
            ResetState::Verified
        } else {
            ResetState::New
        }
    }

    pub fn attempts_exhausted(&self, max_attempts: u32) -> bool {
        self.send_attempts >= max_attempts
    }

    /// Time left before a resend is permitted, `None` when allowed now.
    ///
    /// An unset `refresh_date` counts as "now", so the first resend always passes.
    pub fn cooldown_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let refresh_date = self.refresh_date.unwrap_or(now);
        if refresh_date > now {
            Some(refresh_date - now)
        } else {
            None
        }
    }

    /// Apply one resend: push the window forward and grow the next one.
    pub fn register_resend(&mut self, now: DateTime<Utc>, backoff_increment_minutes: u32) {
        let base = self.refresh_date.unwrap_or(now);
        self.refresh_date = Some(base + Duration::minutes(i64::from(self.timeout_minutes)));
        self.timeout_minutes += backoff_increment_minutes;
        self.send_attempts += 1;
    }

    /// NEW -> VERIFIED
    pub fn mark_verified(&mut self) -> Result<(), TransitionError> {
        if self.step_verification {
            return Err(TransitionError::AlreadyVerified);
        }
        if self.step_reset {
            return Err(TransitionError::AlreadyReset);
        }
        self.step_verification = true;
        Ok(())
    }

    /// VERIFIED -> RESET
    pub fn mark_reset(&mut self) -> Result<(), TransitionError> {
        self.ensure_resettable()?;
        self.step_reset = true;
        Ok(())
    }

    /// Check that a reset may still be committed
    pub fn ensure_resettable(&self) -> Result<(), TransitionError> {
        if !self.step_verification {
            return Err(TransitionError::NotVerified);
        }
        if self.step_reset {
            return Err(TransitionError::AlreadyReset);
        }
        Ok(())
    }
}

/// Whole minutes, rounded up, for caller-facing wait messages
pub fn minutes_rounded_up(duration: Duration) -> i64 {
    let secs = duration.num_seconds().max(0);
    (secs + 59) / 60
}
