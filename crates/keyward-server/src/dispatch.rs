//! Command dispatcher
//!
//! Maps a command pattern and its JSON payload onto a service call and turns
//! the outcome into a `Reply`. Transport agnostic; the TCP listener and the
//! integration tests both drive it directly.

use std::sync::Arc;

use keyward_core::{
    messages, AppConfig, CredentialStore, DatabaseConfig, ErrorKind, IdentityError, MemoryStore,
    PgStore, Reply, ResetRequestStore, Result, RoleStore, StoreBackend, StoreResult,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument};

use crate::auth::{
    ArchiveRequest, AuthenticationService, ChangePasswordRequest, LoginRequest, PasswordService,
    RegisterRequest, TokenService,
};
use crate::clock::Clock;
use crate::notify::NotificationGateway;
use crate::recovery::{
    ForgotPasswordRequest, ForgotVerifyRequest, PasswordRecoveryService, ResendRequest,
    ResetPasswordRequest,
};
use crate::roles::{CreateRoleRequest, RoleService};
use crate::state::ServiceState;

pub const USER_REGISTER: &str = "user:register";
pub const USER_CREATE: &str = "user:create";
pub const USER_LOGIN: &str = "user:login";
pub const USER_VERIFY: &str = "user:verify";
pub const USER_ARCHIVE: &str = "user:archive";
pub const USER_LIST: &str = "user:list";
pub const USER_REFRESH_TOKEN: &str = "user:refreshtoken";
pub const PASSWORD_CHANGE: &str = "password:change";
pub const PASSWORD_FORGOT: &str = "password:forgot";
pub const PASSWORD_RESEND: &str = "password:refreshverify";
pub const PASSWORD_FORGOT_VERIFY: &str = "password:forgotverify";
pub const PASSWORD_RESET: &str = "password:reset";
pub const ROLES_CREATE: &str = "roles:create";
pub const ROLES_LIST: &str = "roles:list";
pub const SERVICE_HEALTH: &str = "service:health";

/// Every pattern the dispatcher answers
pub const COMMANDS: &[&str] = &[
    USER_REGISTER,
    USER_CREATE,
    USER_LOGIN,
    USER_VERIFY,
    USER_ARCHIVE,
    USER_LIST,
    USER_REFRESH_TOKEN,
    PASSWORD_CHANGE,
    PASSWORD_FORGOT,
    PASSWORD_RESEND,
    PASSWORD_FORGOT_VERIFY,
    PASSWORD_RESET,
    ROLES_CREATE,
    ROLES_LIST,
    SERVICE_HEALTH,
];

/// Token given either as a bare string or wrapped in an object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenPayload {
    Bare(String),
    Object(TokenObject),
}

#[derive(Debug, Deserialize)]
struct TokenObject {
    #[serde(
        alias = "verificationToken",
        alias = "verification",
        alias = "refreshToken",
        alias = "refresh"
    )]
    token: String,
}

impl TokenPayload {
    fn into_token(self) -> String {
        match self {
            TokenPayload::Bare(token) => token,
            TokenPayload::Object(object) => object.token,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthReport {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    commands_handled: u64,
}

/// Store handles backing the services
#[derive(Clone)]
pub struct Backend {
    pub accounts: Arc<dyn CredentialStore>,
    pub resets: Arc<dyn ResetRequestStore>,
    pub roles: Arc<dyn RoleStore>,
}

impl Backend {
    /// Process-local stores
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            accounts: store.clone(),
            resets: store.clone(),
            roles: store,
        }
    }

    /// Connect to PostgreSQL and apply pending migrations
    pub async fn postgres(config: &DatabaseConfig) -> StoreResult<Self> {
        let store = PgStore::connect(&config.postgres_url, config.pool_size).await?;
        store.migrate().await?;
        let store = Arc::new(store);
        Ok(Self {
            accounts: store.clone(),
            resets: store.clone(),
            roles: store,
        })
    }

    pub async fn from_config(config: &DatabaseConfig) -> StoreResult<Self> {
        match config.backend {
            StoreBackend::Postgres => Self::postgres(config).await,
            StoreBackend::Memory => Ok(Self::memory()),
        }
    }
}

/// Routes commands to the identity services
pub struct Dispatcher {
    auth: AuthenticationService,
    recovery: PasswordRecoveryService,
    roles: RoleService,
    state: ServiceState,
}

impl Dispatcher {
    pub fn new(
        config: &AppConfig,
        backend: Backend,
        gateway: Arc<dyn NotificationGateway>,
        clock: Arc<dyn Clock>,
        passwords: PasswordService,
    ) -> Self {
        let tokens = Arc::new(TokenService::new(&config.jwt));

        let auth = AuthenticationService::new(
            backend.accounts.clone(),
            backend.roles.clone(),
            tokens.clone(),
            passwords.clone(),
            gateway.clone(),
            config,
        );
        let recovery = PasswordRecoveryService::new(
            backend.accounts,
            backend.resets,
            tokens,
            passwords,
            gateway,
            clock,
            config.recovery.clone(),
        );

        Self {
            auth,
            recovery,
            roles: RoleService::new(backend.roles),
            state: ServiceState::new(),
        }
    }

    pub fn roles(&self) -> &RoleService {
        &self.roles
    }

    pub fn state(&self) -> &ServiceState {
        &self.state
    }

    /// Run one command. Never fails: errors become error replies.
    #[instrument(skip(self, data))]
    pub async fn dispatch(&self, pattern: &str, data: Value) -> Reply {
        self.state.increment_commands();

        match self.route(pattern, data).await {
            Ok(reply) => {
                debug!("Command succeeded");
                reply
            }
            Err(e) => {
                if e.kind() == ErrorKind::Internal {
                    error!(error = %e, "Command failed");
                } else {
                    info!(kind = %e.kind(), message = e.public_message(), "Command rejected");
                }
                e.into()
            }
        }
    }

    async fn route(&self, pattern: &str, data: Value) -> Result<Reply> {
        match pattern {
            USER_REGISTER => {
                let account = self.auth.register(decode::<RegisterRequest>(data)?).await?;
                with_data(Some(messages::ACCOUNT_REGISTERED), &account)
            }
            USER_CREATE => {
                let account = self.auth.create_user(decode::<RegisterRequest>(data)?).await?;
                with_data(Some(messages::ACCOUNT_CREATED), &account)
            }
            USER_LOGIN => {
                let pair = self.auth.login(decode::<LoginRequest>(data)?).await?;
                with_data(None, &pair)
            }
            USER_VERIFY => {
                let token = decode::<TokenPayload>(data)?.into_token();
                self.auth.verify_email(&token).await?;
                Ok(Reply::message(messages::ACCOUNT_VERIFIED))
            }
            USER_ARCHIVE => {
                let message = self.auth.archive_user(decode::<ArchiveRequest>(data)?).await?;
                Ok(Reply::message(message))
            }
            USER_LIST => {
                let accounts = self.auth.list_users().await?;
                with_data(None, &accounts)
            }
            USER_REFRESH_TOKEN => {
                let token = decode::<TokenPayload>(data)?.into_token();
                let access = self.auth.refresh_token(&token).await?;
                with_data(None, &access)
            }
            PASSWORD_CHANGE => {
                self.auth
                    .change_password(decode::<ChangePasswordRequest>(data)?)
                    .await?;
                Ok(Reply::message(messages::PASSWORD_CHANGED))
            }
            PASSWORD_FORGOT => {
                self.recovery
                    .forgot_password(decode::<ForgotPasswordRequest>(data)?)
                    .await?;
                Ok(Reply::message(messages::RESET_MAIL_SENT))
            }
            PASSWORD_RESEND => {
                let message = self
                    .recovery
                    .resend_verification(decode::<ResendRequest>(data)?)
                    .await?;
                Ok(Reply::message(message))
            }
            PASSWORD_FORGOT_VERIFY => {
                self.recovery
                    .forgot_verify(decode::<ForgotVerifyRequest>(data)?)
                    .await?;
                Ok(Reply::message(messages::RESET_VERIFIED))
            }
            PASSWORD_RESET => {
                self.recovery
                    .reset_password(decode::<ResetPasswordRequest>(data)?)
                    .await?;
                Ok(Reply::message(messages::RESET_DONE))
            }
            ROLES_CREATE => {
                let role = self.roles.create_role(decode::<CreateRoleRequest>(data)?).await?;
                with_data(Some(messages::ROLE_CREATED), &role)
            }
            ROLES_LIST => {
                let roles = self.roles.list_roles().await?;
                with_data(None, &roles)
            }
            SERVICE_HEALTH => with_data(
                None,
                &HealthReport {
                    status: "healthy",
                    version: env!("CARGO_PKG_VERSION"),
                    uptime_seconds: self.state.uptime_secs(),
                    commands_handled: self.state.commands_handled(),
                },
            ),
            _ => Err(IdentityError::bad_request(messages::UNKNOWN_COMMAND)),
        }
    }
}

fn decode<T: DeserializeOwned>(data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| {
        debug!(error = %e, "Payload rejected");
        IdentityError::bad_request(messages::MALFORMED_PAYLOAD)
    })
}

fn with_data<T: Serialize>(message: Option<&str>, data: &T) -> Result<Reply> {
    let data = serde_json::to_value(data)
        .map_err(|e| IdentityError::internal(format!("reply serialization failed: {e}")))?;
    Ok(Reply::Ok {
        message: message.map(str::to_string),
        data: Some(data),
    })
}
