//! Security audit logging for identity events
//!
//! Every event is logged at INFO level on the "audit" target so it can be
//! filtered and routed separately from application logs. Passwords, hashes
//! and token values never appear in an event.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// Security audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Account created (self-registration or admin-side)
    RegistrationSuccess {
        user_id: Uuid,
        email: String,
        role: String,
        self_service: bool,
    },

    /// Registration refused
    RegistrationFailure { email: String, reason: String },

    /// Successful login
    LoginSuccess { user_id: Uuid, email: String },

    /// Failed login attempt
    LoginFailure { email: String, reason: String },

    /// Registration link redeemed
    EmailVerified { user_id: Uuid, email: String },

    /// Password changed from an active session
    PasswordChange { user_id: Uuid, email: String },

    /// Account blocked or unblocked
    AccountArchived {
        user_id: Uuid,
        email: String,
        requested_by: String,
        active: bool,
    },

    /// Access token minted from a refresh token
    TokenRefresh { user_id: Uuid, email: String },

    /// Invalid or expired token presented
    InvalidToken { purpose: String, reason: String },

    /// Password reset requested
    ResetRequested {
        email: String,
        origin: Option<serde_json::Value>,
    },

    /// Reset mail sent again
    ResetResent { email: String, send_attempts: u32 },

    /// Reset link redeemed
    ResetVerified { email: String },

    /// New password committed through the reset flow
    ResetCompleted { email: String },

    /// Role record created
    RoleCreated { name: String },
}

/// Log a security audit event with structured fields
pub fn audit_log(event: &AuditEvent) {
    let timestamp = Utc::now();

    let event_json = serde_json::to_string(event)
        .unwrap_or_else(|e| format!("{{\"error\":\"Failed to serialize audit event: {e}\"}}"));

    match event {
        AuditEvent::RegistrationSuccess {
            user_id,
            email,
            role,
            self_service,
        } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                user_id = %user_id,
                email = %email,
                role = %role,
                self_service = %self_service,
                "Registration successful"
            );
        }
        AuditEvent::RegistrationFailure { email, reason } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                email = %email,
                reason = %reason,
                "Registration failed"
            );
        }
        AuditEvent::LoginSuccess { user_id, email } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                user_id = %user_id,
                email = %email,
                "Login successful"
            );
        }
        AuditEvent::LoginFailure { email, reason } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                email = %email,
                reason = %reason,
                "Login failed"
            );
        }
        AuditEvent::EmailVerified { user_id, email } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                user_id = %user_id,
                email = %email,
                "Email verified"
            );
        }
        AuditEvent::PasswordChange { user_id, email } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                user_id = %user_id,
                email = %email,
                "Password changed"
            );
        }
        AuditEvent::AccountArchived {
            user_id,
            email,
            requested_by,
            active,
        } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                user_id = %user_id,
                email = %email,
                requested_by = %requested_by,
                active = %active,
                "Account status changed"
            );
        }
        AuditEvent::TokenRefresh { user_id, email } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                user_id = %user_id,
                email = %email,
                "Token refresh"
            );
        }
        AuditEvent::InvalidToken { purpose, reason } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                purpose = %purpose,
                reason = %reason,
                "Invalid token"
            );
        }
        AuditEvent::ResetRequested { email, .. } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                email = %email,
                "Password reset requested"
            );
        }
        AuditEvent::ResetResent {
            email,
            send_attempts,
        } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                email = %email,
                send_attempts = %send_attempts,
                "Password reset mail resent"
            );
        }
        AuditEvent::ResetVerified { email } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                email = %email,
                "Password reset link verified"
            );
        }
        AuditEvent::ResetCompleted { email } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                email = %email,
                "Password reset completed"
            );
        }
        AuditEvent::RoleCreated { name } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                role = %name,
                "Role created"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_event_serialization() {
        let event = AuditEvent::LoginSuccess {
            user_id: Uuid::new_v4(),
            email: "test@example.com".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"login_success\""));
        assert!(json.contains("test@example.com"));
    }

    #[test]
    fn test_reset_events_tagged() {
        let json = serde_json::to_value(AuditEvent::ResetResent {
            email: "a@x.com".to_string(),
            send_attempts: 2,
        })
        .unwrap();

        assert_eq!(json["event_type"], "reset_resent");
        assert_eq!(json["send_attempts"], 2);
    }

    #[test]
    fn test_audit_log_does_not_panic() {
        audit_log(&AuditEvent::LoginFailure {
            email: "test@example.com".to_string(),
            reason: "password mismatch".to_string(),
        });
        audit_log(&AuditEvent::AccountArchived {
            user_id: Uuid::new_v4(),
            email: "b@x.com".to_string(),
            requested_by: "a@x.com".to_string(),
            active: false,
        });
        audit_log(&AuditEvent::InvalidToken {
            purpose: "password_reset".to_string(),
            reason: "expired".to_string(),
        });
    }
}
