//! Authentication service layer
//!
//! Registration, login, email verification, password change, token refresh
//! and account archiving. Persistence goes through `CredentialStore`; the
//! store's unique index is the only duplicate-email check.

use std::sync::Arc;

use chrono::Duration;
use keyward_core::{
    messages, normalize_email, AccessToken, AccountPublic, AppConfig, CredentialStore,
    IdentityError, Result, RoleRef, RoleStore, ServicesConfig, StoreError, TokenPair, UserAccount,
    ROLE_ADMIN, ROLE_GUEST, ROLE_MEMBER,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;
use validator::Validate;

use super::password::PasswordService;
use super::token::{EmailClaims, SessionClaims, TokenPurpose, TokenService};
use crate::audit::{audit_log, AuditEvent};
use crate::notify::{NotificationGateway, OutboundEvent, TOPIC_PROFILE_GET_ID};

/// User registration request (also used for admin-side creation)
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[validate(email)]
    pub email: String,
    pub password: String,
    #[serde(default, alias = "is_admin")]
    pub is_admin: bool,
}

/// User login request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Password change bound to a live session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub email: String,
    #[serde(alias = "accessToken")]
    pub access: String,
    #[serde(alias = "old_password")]
    pub old_password: String,
    #[serde(alias = "new_password", alias = "passwordNew")]
    pub new_password: String,
    #[serde(alias = "confirm_password", alias = "passwordConfirm")]
    pub confirm_password: String,
}

/// Block / unblock request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRequest {
    pub id: Uuid,
    #[serde(alias = "requester_email")]
    pub requester_email: String,
    pub active: bool,
}

/// Authentication service
pub struct AuthenticationService {
    accounts: Arc<dyn CredentialStore>,
    roles: Arc<dyn RoleStore>,
    tokens: Arc<TokenService>,
    passwords: PasswordService,
    gateway: Arc<dyn NotificationGateway>,
    services: ServicesConfig,
    verification_ttl: Duration,
}

impl AuthenticationService {
    pub fn new(
        accounts: Arc<dyn CredentialStore>,
        roles: Arc<dyn RoleStore>,
        tokens: Arc<TokenService>,
        passwords: PasswordService,
        gateway: Arc<dyn NotificationGateway>,
        config: &AppConfig,
    ) -> Self {
        Self {
            accounts,
            roles,
            tokens,
            passwords,
            gateway,
            services: config.services.clone(),
            verification_ttl: config.recovery.verification_ttl(),
        }
    }

    /// Self-service registration.
    ///
    /// The account starts unverified; the verification link and the profile
    /// creation event are best-effort and never roll the account back.
    pub async fn register(&self, request: RegisterRequest) -> Result<AccountPublic> {
        let account = self.create_account(&request, true).await?;
        let token = account.verification.clone().unwrap_or_default();

        self.gateway
            .emit(OutboundEvent::ProfileCreated {
                email: account.email.clone(),
                owner: account.id,
            })
            .await;
        self.gateway
            .emit(OutboundEvent::VerificationMail {
                email: account.email.clone(),
                token,
            })
            .await;

        Ok(account.to_public())
    }

    /// Admin-side creation: the account is verified up front and no mail is sent
    pub async fn create_user(&self, request: RegisterRequest) -> Result<AccountPublic> {
        let account = self.create_account(&request, false).await?;

        self.gateway
            .emit(OutboundEvent::ProfileCreated {
                email: account.email.clone(),
                owner: account.id,
            })
            .await;

        Ok(account.to_public())
    }

    async fn create_account(
        &self,
        request: &RegisterRequest,
        self_service: bool,
    ) -> Result<UserAccount> {
        let email = normalize_email(&request.email);
        if request.validate().is_err() {
            return Err(IdentityError::bad_request(messages::INVALID_EMAIL));
        }
        if request.password.is_empty() {
            return Err(IdentityError::bad_request(messages::EMPTY_PASSWORD));
        }

        let role = self.resolve_role(request.is_admin).await?;
        let password_hash = self.passwords.hash(&request.password).await?;
        let mut account = UserAccount::new(&email, password_hash, role);

        if self_service {
            let token = self.tokens.sign(
                TokenPurpose::EmailVerification,
                &EmailClaims {
                    email: email.clone(),
                },
                self.verification_ttl,
            )?;
            account = account.with_verification(token);
        } else {
            account.is_verify = true;
        }

        match self.accounts.insert_account(&account).await {
            Ok(()) => {}
            Err(StoreError::UniqueViolation(_)) => {
                audit_log(&AuditEvent::RegistrationFailure {
                    email,
                    reason: "email already registered".to_string(),
                });
                return Err(IdentityError::conflict(messages::EMAIL_USER_CONFLICT));
            }
            Err(e) => return Err(e.into()),
        }

        audit_log(&AuditEvent::RegistrationSuccess {
            user_id: account.id,
            email: account.email.clone(),
            role: account.permissions.clone(),
            self_service,
        });
        Ok(account)
    }

    /// Admin or Member role record; Guest when the record does not exist
    async fn resolve_role(&self, is_admin: bool) -> Result<RoleRef> {
        let name = if is_admin { ROLE_ADMIN } else { ROLE_MEMBER };
        match self.roles.find_role(name).await? {
            Some(role) => Ok(role.to_ref()),
            None => {
                warn!(role = name, "Role record missing, falling back to Guest");
                Ok(RoleRef::new(ROLE_GUEST, Some(ROLE_GUEST.to_string())))
            }
        }
    }

    /// Check credentials and issue a fresh token pair.
    ///
    /// The pair replaces whatever session the account held before.
    pub async fn login(&self, request: LoginRequest) -> Result<TokenPair> {
        let email = normalize_email(&request.email);
        let account = match self.accounts.find_active_by_email(&email).await? {
            Some(account) => account,
            None => {
                audit_log(&AuditEvent::LoginFailure {
                    email,
                    reason: "unknown or inactive account".to_string(),
                });
                return Err(IdentityError::not_found(messages::USER_NOT_FOUND));
            }
        };

        if account.ban {
            audit_log(&AuditEvent::LoginFailure {
                email,
                reason: "account banned".to_string(),
            });
            return Err(IdentityError::bad_request(messages::ACCOUNT_BANNED));
        }

        if !self
            .passwords
            .verify(&request.password, &account.password_hash)
            .await?
        {
            audit_log(&AuditEvent::LoginFailure {
                email,
                reason: "password mismatch".to_string(),
            });
            return Err(IdentityError::bad_request(
                messages::EMAIL_OR_PASSWORD_INCORRECT,
            ));
        }

        let claims = self.session_claims(&account).await?;
        let pair = self.tokens.issue_pair(&claims)?;
        self.accounts
            .save_session(account.id, &pair.access, &pair.refresh)
            .await?;

        audit_log(&AuditEvent::LoginSuccess {
            user_id: account.id,
            email: account.email,
        });
        Ok(pair)
    }

    /// Redeem the registration link
    pub async fn verify_email(&self, token: &str) -> Result<()> {
        if let Err(e) = self
            .tokens
            .verify::<EmailClaims>(token, TokenPurpose::EmailVerification)
        {
            audit_log(&AuditEvent::InvalidToken {
                purpose: "email_verification".to_string(),
                reason: e.reason().to_string(),
            });
            return Err(IdentityError::bad_request(
                messages::INVALID_VERIFICATION_TOKEN,
            ));
        }

        let account = self
            .accounts
            .find_by_verification(token)
            .await?
            .ok_or_else(|| IdentityError::not_found(messages::USER_NOT_FOUND))?;

        if account.is_verify {
            debug!(user_id = %account.id, "Account already verified");
        }
        self.accounts.mark_verified(account.id).await?;

        audit_log(&AuditEvent::EmailVerified {
            user_id: account.id,
            email: account.email,
        });
        Ok(())
    }

    /// Change the password of the account holding `request.access`
    pub async fn change_password(&self, request: ChangePasswordRequest) -> Result<()> {
        let account = self
            .accounts
            .find_by_session(&request.email, &request.access)
            .await?
            .filter(|account| account.active)
            .ok_or_else(|| IdentityError::not_found(messages::SESSION_NOT_FOUND))?;

        if !self
            .passwords
            .verify(&request.old_password, &account.password_hash)
            .await?
        {
            return Err(IdentityError::bad_request(messages::OLD_PASSWORD_INCORRECT));
        }
        if request.new_password != request.confirm_password {
            return Err(IdentityError::bad_request(messages::PASSWORDS_DO_NOT_MATCH));
        }
        if request.new_password.is_empty() {
            return Err(IdentityError::bad_request(messages::EMPTY_PASSWORD));
        }

        let password_hash = self.passwords.hash(&request.new_password).await?;
        self.accounts
            .update_password_hash(account.id, &password_hash)
            .await?;

        audit_log(&AuditEvent::PasswordChange {
            user_id: account.id,
            email: account.email,
        });
        Ok(())
    }

    /// Mint a new access token from the stored refresh token.
    ///
    /// The refresh token itself is not rotated.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<AccessToken> {
        let unauthorized = || IdentityError::unauthorized(messages::NOT_AUTHORIZED);

        let account = self
            .accounts
            .find_by_refresh_token(refresh_token)
            .await?
            .filter(|account| account.active)
            .ok_or_else(unauthorized)?;

        if let Err(e) = self
            .tokens
            .verify::<SessionClaims>(refresh_token, TokenPurpose::Refresh)
        {
            audit_log(&AuditEvent::InvalidToken {
                purpose: "refresh".to_string(),
                reason: e.reason().to_string(),
            });
            return Err(unauthorized());
        }

        let claims = self.session_claims(&account).await?;
        let access = self.tokens.issue_access(&claims)?;
        self.accounts.save_access_token(account.id, &access).await?;

        warn!(
            user_id = %account.id,
            "Refresh token reused without rotation; it stays valid until it expires"
        );
        audit_log(&AuditEvent::TokenRefresh {
            user_id: account.id,
            email: account.email,
        });
        Ok(AccessToken { access })
    }

    /// Block or unblock an account. Requesters cannot target themselves.
    pub async fn archive_user(&self, request: ArchiveRequest) -> Result<&'static str> {
        let account = self
            .accounts
            .find_by_id(request.id)
            .await?
            .ok_or_else(|| IdentityError::not_found(messages::USER_NOT_FOUND))?;

        if normalize_email(&request.requester_email) == account.email {
            return Err(IdentityError::bad_request(messages::CANNOT_ARCHIVE_SELF));
        }

        self.accounts.set_active(account.id, request.active).await?;

        audit_log(&AuditEvent::AccountArchived {
            user_id: account.id,
            email: account.email,
            requested_by: normalize_email(&request.requester_email),
            active: request.active,
        });

        Ok(if request.active {
            messages::ACCOUNT_UNBLOCKED
        } else {
            messages::ACCOUNT_BLOCKED
        })
    }

    pub async fn list_users(&self) -> Result<Vec<AccountPublic>> {
        let accounts = self.accounts.list_accounts().await?;
        Ok(accounts.iter().map(UserAccount::to_public).collect())
    }

    async fn session_claims(&self, account: &UserAccount) -> Result<SessionClaims> {
        let sub = if self.services.resolve_profile {
            self.resolve_profile_id(account.id).await?
        } else {
            account.id.to_string()
        };

        Ok(SessionClaims {
            sub,
            uid: account.id,
            email: account.email.clone(),
            roles: account.role_names(),
        })
    }

    /// Ask the profile service for the profile linked to `owner`
    async fn resolve_profile_id(&self, owner: Uuid) -> Result<String> {
        let reply = self
            .gateway
            .request(
                TOPIC_PROFILE_GET_ID,
                json!({ "owner": owner }),
                self.services.request_timeout(),
            )
            .await
            .map_err(|e| {
                warn!(owner = %owner, error = %e, "Profile lookup failed");
                IdentityError::from(e)
            })?;

        match reply.get("id") {
            Some(Value::String(id)) => Ok(id.clone()),
            Some(Value::Number(id)) => Ok(id.to_string()),
            _ => {
                warn!(owner = %owner, reply = %reply, "Profile reply without id");
                Err(IdentityError::downstream(messages::PROFILE_UNAVAILABLE))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password::PasswordConfig;
    use crate::notify::{RecordingGateway, TOPIC_MAIL_SEND};
    use keyward_core::{ErrorKind, MemoryStore, Role};

    struct Fixture {
        service: AuthenticationService,
        store: Arc<MemoryStore>,
        gateway: Arc<RecordingGateway>,
        tokens: Arc<TokenService>,
    }

    async fn fixture() -> Fixture {
        let config = AppConfig::default();
        let store = Arc::new(MemoryStore::new());
        store
            .create_role(&Role::new(ROLE_MEMBER, "member"))
            .await
            .unwrap();
        let gateway = Arc::new(RecordingGateway::new());
        let tokens = Arc::new(TokenService::new(&config.jwt));

        let service = AuthenticationService::new(
            store.clone(),
            store.clone(),
            tokens.clone(),
            PasswordService::new(PasswordConfig::fast()),
            gateway.clone(),
            &config,
        );
        Fixture {
            service,
            store,
            gateway,
            tokens,
        }
    }

    fn register_request(email: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            email: email.to_string(),
            password: password.to_string(),
            is_admin: false,
        }
    }

    fn login_request(email: &str, password: &str) -> LoginRequest {
        LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_stores_hash_and_sends_link() {
        let f = fixture().await;
        let account = f.service.register(register_request("A@x.com", "p1")).await.unwrap();

        assert_eq!(account.email, "a@x.com");
        assert!(!account.is_verify);

        let stored = f.store.find_by_id(account.id).await.unwrap().unwrap();
        assert!(stored.password_hash.starts_with("$argon2id$"));
        assert_eq!(stored.roles[0].permissions.as_deref(), Some("member"));
        assert!(stored.verification.is_some());
        assert_eq!(
            f.gateway.last_token(TOPIC_MAIL_SEND, "a@x.com"),
            stored.verification
        );
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_input() {
        let f = fixture().await;

        let err = f.service.register(register_request("not-an-email", "p1")).await.unwrap_err();
        assert_eq!(err.public_message(), messages::INVALID_EMAIL);

        let err = f.service.register(register_request("a@x.com", "")).await.unwrap_err();
        assert_eq!(err.public_message(), messages::EMPTY_PASSWORD);
    }

    #[tokio::test]
    async fn test_missing_role_falls_back_to_guest() {
        let f = fixture().await;
        let request = RegisterRequest {
            is_admin: true,
            ..register_request("admin@x.com", "p1")
        };

        let account = f.service.register(request).await.unwrap();
        assert_eq!(account.permissions, ROLE_GUEST);
    }

    #[tokio::test]
    async fn test_login_issues_pair_and_stores_it() {
        let f = fixture().await;
        let account = f.service.register(register_request("a@x.com", "p1")).await.unwrap();

        let pair = f.service.login(login_request("a@x.com", "p1")).await.unwrap();
        let claims: SessionClaims = f.tokens.verify(&pair.access, TokenPurpose::Access).unwrap();
        assert_eq!(claims.sub, format!("profile-{}", account.id));
        assert_eq!(claims.uid, account.id);

        let stored = f.store.find_by_id(account.id).await.unwrap().unwrap();
        assert_eq!(stored.access_token.as_deref(), Some(pair.access.as_str()));
        assert_eq!(stored.refresh_token.as_deref(), Some(pair.refresh.as_str()));
    }

    #[tokio::test]
    async fn test_login_profile_outage_fails_login() {
        let f = fixture().await;
        f.service.register(register_request("a@x.com", "p1")).await.unwrap();
        f.gateway.fail_requests(true);

        let err = f.service.login(login_request("a@x.com", "p1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DownstreamUnavailable);
    }

    #[tokio::test]
    async fn test_refresh_rejects_access_token() {
        let f = fixture().await;
        f.service.register(register_request("a@x.com", "p1")).await.unwrap();
        let pair = f.service.login(login_request("a@x.com", "p1")).await.unwrap();

        let err = f.service.refresh_token(&pair.access).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        let fresh = f.service.refresh_token(&pair.refresh).await.unwrap();
        let claims: SessionClaims = f.tokens.verify(&fresh.access, TokenPurpose::Access).unwrap();
        assert_eq!(claims.email, "a@x.com");
    }

    #[tokio::test]
    async fn test_archive_self_is_rejected() {
        let f = fixture().await;
        let account = f.service.register(register_request("a@x.com", "p1")).await.unwrap();

        let err = f
            .service
            .archive_user(ArchiveRequest {
                id: account.id,
                requester_email: "A@X.com".to_string(),
                active: false,
            })
            .await
            .unwrap_err();
        assert_eq!(err.public_message(), messages::CANNOT_ARCHIVE_SELF);
    }

    #[test]
    fn test_change_password_request_aliases() {
        let request: ChangePasswordRequest = serde_json::from_value(json!({
            "email": "a@x.com",
            "accessToken": "t",
            "oldPassword": "p1",
            "passwordNew": "p2",
            "passwordConfirm": "p2"
        }))
        .unwrap();
        assert_eq!(request.access, "t");
        assert_eq!(request.new_password, "p2");
    }
}
