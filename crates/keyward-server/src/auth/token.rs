//! Token signing and verification
//!
//! HMAC-SHA256 JWTs. Every token carries a `purpose` claim so an access token
//! can never be redeemed as a reset link (and vice versa).

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use keyward_core::{JwtConfig, TokenPair};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// What a token may be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenPurpose {
    Access,
    Refresh,
    EmailVerification,
    PasswordReset,
}

/// Session claims shared by access and refresh tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject: linked profile id, or the account id when no profile is resolved
    pub sub: String,
    /// Account id
    pub uid: Uuid,
    pub email: String,
    pub roles: Vec<String>,
}

/// Claims of the mailed verification and reset links
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailClaims {
    pub email: String,
}

/// Registered claims wrapped around the caller's payload
#[derive(Debug, Serialize, Deserialize)]
struct Envelope<C> {
    iss: String,
    jti: String,
    iat: i64,
    exp: i64,
    purpose: TokenPurpose,
    #[serde(flatten)]
    claims: C,
}

/// Token generation and validation errors
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Failed to encode JWT: {0}")]
    Encoding(#[from] jsonwebtoken::errors::Error),

    #[error("Invalid token format")]
    Malformed,

    #[error("Invalid token signature")]
    BadSignature,

    #[error("Token has expired")]
    Expired,

    #[error("Token was issued for {actual:?}, expected {expected:?}")]
    WrongPurpose {
        expected: TokenPurpose,
        actual: TokenPurpose,
    },
}

impl TokenError {
    /// Short reason suitable for the audit log
    pub fn reason(&self) -> &'static str {
        match self {
            TokenError::Encoding(_) => "encoding",
            TokenError::Malformed => "malformed",
            TokenError::BadSignature => "bad_signature",
            TokenError::Expired => "expired",
            TokenError::WrongPurpose { .. } => "wrong_purpose",
        }
    }
}

/// Signs and verifies every token the service hands out
pub struct TokenService {
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenService {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            issuer: config.issuer.clone(),
            access_ttl: Duration::seconds(config.access_expiration_secs as i64),
            refresh_ttl: Duration::seconds(config.refresh_expiration_secs as i64),
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
        }
    }

    /// Sign `claims` for `purpose`, valid for `ttl`
    pub fn sign<C: Serialize>(
        &self,
        purpose: TokenPurpose,
        claims: &C,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        let now = Utc::now().timestamp();
        let envelope = Envelope {
            iss: self.issuer.clone(),
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + ttl.num_seconds(),
            purpose,
            claims,
        };

        let token = encode(&Header::new(Algorithm::HS256), &envelope, &self.encoding_key)?;
        Ok(token)
    }

    /// Check signature, expiry, issuer and purpose, then return the claims
    pub fn verify<C: DeserializeOwned>(
        &self,
        token: &str,
        purpose: TokenPurpose,
    ) -> Result<C, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.leeway = 0;

        let data = decode::<Envelope<C>>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => TokenError::BadSignature,
                _ => TokenError::Malformed,
            }
        })?;

        if data.claims.purpose != purpose {
            return Err(TokenError::WrongPurpose {
                expected: purpose,
                actual: data.claims.purpose,
            });
        }

        Ok(data.claims.claims)
    }

    /// Access + refresh pair over the same session claims
    pub fn issue_pair(&self, claims: &SessionClaims) -> Result<TokenPair, TokenError> {
        Ok(TokenPair {
            access: self.sign(TokenPurpose::Access, claims, self.access_ttl)?,
            refresh: self.sign(TokenPurpose::Refresh, claims, self.refresh_ttl)?,
        })
    }

    pub fn issue_access(&self, claims: &SessionClaims) -> Result<String, TokenError> {
        self.sign(TokenPurpose::Access, claims, self.access_ttl)
    }
}
