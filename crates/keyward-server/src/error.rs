//! Mapping of server-side failures onto the identity error kinds

use keyward_core::{messages, IdentityError};

use crate::auth::password::PasswordError;
use crate::auth::token::TokenError;
use crate::notify::GatewayError;

impl From<PasswordError> for IdentityError {
    fn from(err: PasswordError) -> Self {
        IdentityError::Internal(err.to_string())
    }
}

/// Default mapping for a token the caller presented.
///
/// Signing failures are faults; anything wrong with the presented token is
/// the caller's problem. Refresh overrides this with `Unauthorized`.
impl From<TokenError> for IdentityError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Encoding(e) => IdentityError::Internal(format!("token signing failed: {e}")),
            _ => IdentityError::BadRequest(messages::INVALID_TOKEN.to_string()),
        }
    }
}

impl From<GatewayError> for IdentityError {
    fn from(_: GatewayError) -> Self {
        IdentityError::DownstreamUnavailable(messages::PROFILE_UNAVAILABLE.to_string())
    }
}
