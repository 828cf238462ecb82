//! Password recovery
//!
//! Each email has at most one live `ResetRequest`, moving through
//! `NEW -> VERIFIED -> RESET`. Resends are rate limited by a growing
//! cooldown and a hard attempt ceiling; every write to a request is a
//! compare-and-swap on its version.

use std::sync::Arc;

use keyward_core::{
    messages, minutes_rounded_up, normalize_email, CredentialStore, IdentityError,
    LocationMetadata, RecoveryConfig, ResetRequest, ResetRequestStore, Result, StoreError,
    TransitionError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::audit::{audit_log, AuditEvent};
use crate::auth::{EmailClaims, PasswordService, TokenPurpose, TokenService};
use crate::clock::Clock;
use crate::notify::{NotificationGateway, OutboundEvent};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForgotPasswordRequest {
    pub email: String,
    #[serde(default, alias = "location", alias = "location_metadata")]
    pub location_metadata: LocationMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResendRequest {
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForgotVerifyRequest {
    #[serde(alias = "verification_key", alias = "token")]
    pub verification_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetPasswordRequest {
    #[serde(alias = "verification_key", alias = "token")]
    pub verification_key: String,
    #[serde(alias = "new_password", alias = "passwordNew")]
    pub new_password: String,
    #[serde(alias = "confirm_password", alias = "passwordConfirm")]
    pub confirm_password: String,
}

/// Password recovery service
pub struct PasswordRecoveryService {
    accounts: Arc<dyn CredentialStore>,
    resets: Arc<dyn ResetRequestStore>,
    tokens: Arc<TokenService>,
    passwords: PasswordService,
    gateway: Arc<dyn NotificationGateway>,
    clock: Arc<dyn Clock>,
    policy: RecoveryConfig,
}

impl PasswordRecoveryService {
    pub fn new(
        accounts: Arc<dyn CredentialStore>,
        resets: Arc<dyn ResetRequestStore>,
        tokens: Arc<TokenService>,
        passwords: PasswordService,
        gateway: Arc<dyn NotificationGateway>,
        clock: Arc<dyn Clock>,
        policy: RecoveryConfig,
    ) -> Self {
        Self {
            accounts,
            resets,
            tokens,
            passwords,
            gateway,
            clock,
            policy,
        }
    }

    /// Open a reset request and mail the link
    pub async fn forgot_password(&self, request: ForgotPasswordRequest) -> Result<()> {
        let email = normalize_email(&request.email);
        if self.accounts.find_active_by_email(&email).await?.is_none() {
            return Err(IdentityError::not_found(messages::USER_NOT_FOUND));
        }

        let now = self.clock.now();
        let key = self.tokens.sign(
            TokenPurpose::PasswordReset,
            &EmailClaims {
                email: email.clone(),
            },
            self.policy.reset_token_ttl(),
        )?;

        let mut reset = ResetRequest::new(
            &email,
            key.clone(),
            now,
            self.policy.retention(),
            self.policy.initial_timeout_minutes,
        );
        let origin = if request.location_metadata.is_empty() {
            None
        } else {
            Some(serde_json::Value::Object(request.location_metadata.clone()))
        };
        reset.record_origin(now, request.location_metadata);

        match self.resets.create_reset(&reset).await {
            Ok(_) => {}
            Err(StoreError::UniqueViolation(_)) => {
                return Err(IdentityError::conflict(messages::RESET_REQUEST_CONFLICT));
            }
            Err(e) => return Err(e.into()),
        }

        audit_log(&AuditEvent::ResetRequested {
            email: email.clone(),
            origin,
        });
        self.gateway
            .emit(OutboundEvent::ForgotPasswordMail { email, token: key })
            .await;
        Ok(())
    }

    /// Mail the same link again, subject to cooldown and attempt ceiling.
    ///
    /// Returns the caller-facing message with the attempt count.
    pub async fn resend_verification(&self, request: ResendRequest) -> Result<String> {
        let email = normalize_email(&request.email);
        let now = self.clock.now();
        let max = self.policy.max_send_attempts;

        let mut reset = self
            .resets
            .find_live_by_email(&email, now)
            .await?
            .ok_or_else(|| IdentityError::not_found(messages::RESET_REQUEST_NOT_FOUND))?;

        if reset.attempts_exhausted(max) {
            return Err(IdentityError::bad_request(
                messages::resend_attempts_exhausted(max),
            ));
        }
        if reset.step_reset {
            return Err(IdentityError::bad_request(messages::RESET_ALREADY_DONE));
        }
        if let Some(remaining) = reset.cooldown_remaining(now) {
            debug!(email = %email, remaining_secs = remaining.num_seconds(), "Resend still cooling down");
            return Err(IdentityError::bad_request(messages::resend_cooldown(
                minutes_rounded_up(remaining),
                reset.send_attempts,
                max,
            )));
        }

        reset.register_resend(now, self.policy.backoff_increment_minutes);
        let stored = self.resets.update_reset(&reset).await?;

        audit_log(&AuditEvent::ResetResent {
            email: email.clone(),
            send_attempts: stored.send_attempts,
        });
        self.gateway
            .emit(OutboundEvent::ForgotPasswordMail {
                email,
                token: stored.verification_key.clone(),
            })
            .await;

        Ok(messages::reset_mail_resent(stored.send_attempts, max))
    }

    /// Redeem the mailed link: NEW -> VERIFIED
    pub async fn forgot_verify(&self, request: ForgotVerifyRequest) -> Result<()> {
        let mut reset = self.live_request_for_key(&request.verification_key).await?;

        reset.mark_verified().map_err(transition_error)?;
        self.resets.update_reset(&reset).await?;

        audit_log(&AuditEvent::ResetVerified { email: reset.email });
        Ok(())
    }

    /// Commit the new password: VERIFIED -> RESET.
    ///
    /// The password is written before `step_reset`; if the second write is
    /// lost the same link can finish the reset. Two calls racing on one link
    /// both write a password before the version check, so the caller that
    /// gets `Conflict` may still be the one whose password was kept.
    pub async fn reset_password(&self, request: ResetPasswordRequest) -> Result<()> {
        let mut reset = self.live_request_for_key(&request.verification_key).await?;
        reset.ensure_resettable().map_err(transition_error)?;

        if request.new_password != request.confirm_password {
            return Err(IdentityError::bad_request(messages::PASSWORDS_DO_NOT_MATCH));
        }
        if request.new_password.is_empty() {
            return Err(IdentityError::bad_request(messages::EMPTY_PASSWORD));
        }

        let password_hash = self.passwords.hash(&request.new_password).await?;
        self.accounts
            .update_password_hash_by_email(&reset.email, &password_hash)
            .await?;

        reset.mark_reset().map_err(transition_error)?;
        if let Err(e) = self.resets.update_reset(&reset).await {
            warn!(
                email = %reset.email,
                error = %e,
                "Password written but reset request not closed"
            );
            return Err(e.into());
        }

        audit_log(&AuditEvent::ResetCompleted { email: reset.email });
        Ok(())
    }

    async fn live_request_for_key(&self, key: &str) -> Result<ResetRequest> {
        if let Err(e) = self
            .tokens
            .verify::<EmailClaims>(key, TokenPurpose::PasswordReset)
        {
            audit_log(&AuditEvent::InvalidToken {
                purpose: "password_reset".to_string(),
                reason: e.reason().to_string(),
            });
            return Err(IdentityError::bad_request(messages::INVALID_TOKEN));
        }

        self.resets
            .find_live_by_key(key, self.clock.now())
            .await?
            .ok_or_else(|| IdentityError::bad_request(messages::INVALID_TOKEN))
    }
}

fn transition_error(err: TransitionError) -> IdentityError {
    let message = match err {
        TransitionError::AlreadyVerified => messages::RESET_ALREADY_VERIFIED,
        TransitionError::AlreadyReset => messages::RESET_ALREADY_DONE,
        TransitionError::NotVerified => messages::RESET_NOT_VERIFIED,
    };
    IdentityError::bad_request(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PasswordConfig;
    use crate::clock::ManualClock;
    use crate::notify::{RecordingGateway, TOPIC_MAIL_FORGOT_PASSWORD};
    use chrono::{Duration, Utc};
    use keyward_core::{AppConfig, ErrorKind, MemoryStore, RoleRef, UserAccount, ROLE_MEMBER};

    struct Fixture {
        service: PasswordRecoveryService,
        store: Arc<MemoryStore>,
        gateway: Arc<RecordingGateway>,
        clock: Arc<ManualClock>,
    }

    async fn fixture() -> Fixture {
        let config = AppConfig::default();
        let store = Arc::new(MemoryStore::new());
        let account = UserAccount::new("a@x.com", "hash".to_string(), RoleRef::new(ROLE_MEMBER, None));
        store.insert_account(&account).await.unwrap();

        let gateway = Arc::new(RecordingGateway::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let service = PasswordRecoveryService::new(
            store.clone(),
            store.clone(),
            Arc::new(TokenService::new(&config.jwt)),
            PasswordService::new(PasswordConfig::fast()),
            gateway.clone(),
            clock.clone(),
            config.recovery,
        );
        Fixture {
            service,
            store,
            gateway,
            clock,
        }
    }

    fn forgot(email: &str) -> ForgotPasswordRequest {
        ForgotPasswordRequest {
            email: email.to_string(),
            location_metadata: LocationMetadata::new(),
        }
    }

    fn resend(email: &str) -> ResendRequest {
        ResendRequest {
            email: email.to_string(),
        }
    }

    fn mailed_key(f: &Fixture) -> String {
        f.gateway
            .last_token(TOPIC_MAIL_FORGOT_PASSWORD, "a@x.com")
            .unwrap()
    }

    #[tokio::test]
    async fn test_forgot_unknown_email_is_not_found() {
        let f = fixture().await;
        let err = f.service.forgot_password(forgot("nobody@x.com")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_second_forgot_conflicts() {
        let f = fixture().await;
        f.service.forgot_password(forgot("A@x.com")).await.unwrap();

        let err = f.service.forgot_password(forgot("a@x.com")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.public_message(), messages::RESET_REQUEST_CONFLICT);
    }

    #[tokio::test]
    async fn test_forgot_allowed_again_after_retention() {
        let f = fixture().await;
        f.service.forgot_password(forgot("a@x.com")).await.unwrap();

        f.clock.advance(Duration::hours(12));
        f.service.forgot_password(forgot("a@x.com")).await.unwrap();
    }

    #[tokio::test]
    async fn test_resend_backoff_sequence() {
        let f = fixture().await;
        f.service.forgot_password(forgot("a@x.com")).await.unwrap();

        let message = f.service.resend_verification(resend("a@x.com")).await.unwrap();
        assert_eq!(message, messages::reset_mail_resent(1, 5));

        let stored = f
            .store
            .find_live_by_email("a@x.com", f.clock.now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.send_attempts, 1);
        assert_eq!(stored.refresh_date, Some(f.clock.now() + Duration::minutes(3)));

        let err = f.service.resend_verification(resend("a@x.com")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert_eq!(err.public_message(), messages::resend_cooldown(3, 1, 5));

        // the rejected call did not touch the record
        let unchanged = f
            .store
            .find_live_by_email("a@x.com", f.clock.now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unchanged, stored);
    }

    #[tokio::test]
    async fn test_resend_ceiling() {
        let f = fixture().await;
        f.service.forgot_password(forgot("a@x.com")).await.unwrap();

        for _ in 0..5 {
            f.service.resend_verification(resend("a@x.com")).await.unwrap();
            f.clock.advance(Duration::minutes(30));
        }

        let err = f.service.resend_verification(resend("a@x.com")).await.unwrap_err();
        assert_eq!(err.public_message(), messages::resend_attempts_exhausted(5));
    }

    #[tokio::test]
    async fn test_resend_reuses_key() {
        let f = fixture().await;
        f.service.forgot_password(forgot("a@x.com")).await.unwrap();
        let first = mailed_key(&f);

        f.service.resend_verification(resend("a@x.com")).await.unwrap();
        assert_eq!(mailed_key(&f), first);
        assert_eq!(f.gateway.events().len(), 2);
    }

    #[tokio::test]
    async fn test_verify_then_reset_is_terminal() {
        let f = fixture().await;
        f.service.forgot_password(forgot("a@x.com")).await.unwrap();
        let key = mailed_key(&f);

        let reset = || ResetPasswordRequest {
            verification_key: key.clone(),
            new_password: "p2".to_string(),
            confirm_password: "p2".to_string(),
        };

        let err = f.service.reset_password(reset()).await.unwrap_err();
        assert_eq!(err.public_message(), messages::RESET_NOT_VERIFIED);

        let verify = ForgotVerifyRequest {
            verification_key: key.clone(),
        };
        f.service.forgot_verify(verify.clone()).await.unwrap();
        let err = f.service.forgot_verify(verify).await.unwrap_err();
        assert_eq!(err.public_message(), messages::RESET_ALREADY_VERIFIED);

        f.service.reset_password(reset()).await.unwrap();
        let account = f.store.find_active_by_email("a@x.com").await.unwrap().unwrap();
        assert!(account.password_hash.starts_with("$argon2id$"));

        let err = f.service.reset_password(reset()).await.unwrap_err();
        assert_eq!(err.public_message(), messages::RESET_ALREADY_DONE);
    }

    #[tokio::test]
    async fn test_reset_mismatch_keeps_password() {
        let f = fixture().await;
        f.service.forgot_password(forgot("a@x.com")).await.unwrap();
        let key = mailed_key(&f);
        f.service
            .forgot_verify(ForgotVerifyRequest {
                verification_key: key.clone(),
            })
            .await
            .unwrap();

        let err = f
            .service
            .reset_password(ResetPasswordRequest {
                verification_key: key,
                new_password: "p2".to_string(),
                confirm_password: "p3".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.public_message(), messages::PASSWORDS_DO_NOT_MATCH);

        let account = f.store.find_active_by_email("a@x.com").await.unwrap().unwrap();
        assert_eq!(account.password_hash, "hash");
    }

    #[tokio::test]
    async fn test_garbage_key_is_invalid_token() {
        let f = fixture().await;
        let err = f
            .service
            .forgot_verify(ForgotVerifyRequest {
                verification_key: "garbage".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert_eq!(err.public_message(), messages::INVALID_TOKEN);
    }

    #[tokio::test]
    async fn test_expired_request_is_invalid_token() {
        let f = fixture().await;
        f.service.forgot_password(forgot("a@x.com")).await.unwrap();
        let key = mailed_key(&f);

        f.clock.advance(Duration::hours(13));
        let err = f
            .service
            .forgot_verify(ForgotVerifyRequest {
                verification_key: key,
            })
            .await
            .unwrap_err();
        assert_eq!(err.public_message(), messages::INVALID_TOKEN);
    }
}
