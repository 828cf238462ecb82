//! Authentication module
//!
//! - Signed tokens with a purpose claim (access, refresh, email verification, password reset)
//! - Password hashing with Argon2
//! - Authentication service for account lifecycle and sessions

pub mod password;
pub mod service;
pub mod token;

pub use password::{PasswordConfig, PasswordError, PasswordService};
pub use service::{
    ArchiveRequest, AuthenticationService, ChangePasswordRequest, LoginRequest, RegisterRequest,
};
pub use token::{EmailClaims, SessionClaims, TokenError, TokenPurpose, TokenService};
