//! Stable caller-facing messages
//!
//! Callers may match on these strings, so they only change with a version bump.

pub const INTERNAL_ERROR: &str = "Internal server error";
pub const RECORD_NOT_FOUND: &str = "Record not found";
pub const CONCURRENT_MODIFICATION: &str = "Record was modified concurrently, please retry";

// Accounts
pub const USER_NOT_FOUND: &str = "404001: User not found";
pub const SESSION_NOT_FOUND: &str = "404003: No active session for this account";
pub const EMAIL_USER_CONFLICT: &str = "409001: User with this email already exists";
pub const EMAIL_OR_PASSWORD_INCORRECT: &str = "401008: Email or password are incorrect";
pub const ACCOUNT_BANNED: &str = "401009: Account is banned";
pub const INVALID_EMAIL: &str = "400001: Invalid email address";
pub const EMPTY_PASSWORD: &str = "400002: Password must not be empty";
pub const OLD_PASSWORD_INCORRECT: &str = "400003: Old password is incorrect";
pub const PASSWORDS_DO_NOT_MATCH: &str = "400004: Password not changed because the passwords do not match";
pub const CANNOT_ARCHIVE_SELF: &str = "400005: You cannot block or unblock yourself";
pub const ACCOUNT_REGISTERED: &str = "Account registered. Follow the link sent to your email to activate it";
pub const ACCOUNT_CREATED: &str = "User was created";
pub const ACCOUNT_VERIFIED: &str = "Your account has been verified";
pub const PASSWORD_CHANGED: &str = "Password was changed successfully";
pub const ACCOUNT_BLOCKED: &str = "User account was blocked";
pub const ACCOUNT_UNBLOCKED: &str = "User account was unblocked";

// Dispatch
pub const UNKNOWN_COMMAND: &str = "400030: Unknown command";
pub const MALFORMED_PAYLOAD: &str = "400031: Malformed payload";

// Tokens
pub const INVALID_TOKEN: &str = "401003: Invalid token";
pub const INVALID_VERIFICATION_TOKEN: &str = "401010: Verification token is invalid or expired";
pub const NOT_AUTHORIZED: &str = "401011: User not authorized, please log in again";

// Downstream services
pub const PROFILE_UNAVAILABLE: &str = "503001: Profile service did not answer, please retry";

// Password recovery
pub const RESET_REQUEST_NOT_FOUND: &str = "404004: No pending password reset for this email";
pub const RESET_REQUEST_CONFLICT: &str =
    "409003: A password reset email was already sent to this address";
pub const RESET_ALREADY_VERIFIED: &str =
    "400010: Password reset link was already verified";
pub const RESET_ALREADY_DONE: &str = "400011: Password was already reset";
pub const RESET_NOT_VERIFIED: &str =
    "400012: Password reset link must be verified first";
pub const RESET_MAIL_SENT: &str = "A password reset email was sent to the given address";
pub const RESET_VERIFIED: &str = "Password reset link verified";
pub const RESET_DONE: &str = "Password was reset successfully";

// Roles
pub const INVALID_ROLE_NAME: &str = "400020: Role name must not be empty";
pub const ROLE_NAME_CONFLICT: &str = "409010: Role with this name already exists";
pub const ROLE_CREATED: &str = "Role was created";

/// Rejection when every resend for a reset request has been used.
pub fn resend_attempts_exhausted(max: u32) -> String {
    format!("400013: Too many password reset requests. Maximum {max} attempts")
}

/// Rejection while the resend cooldown is still running.
pub fn resend_cooldown(remaining_minutes: i64, attempts: u32, max: u32) -> String {
    format!("400014: Please wait {remaining_minutes} minutes. Attempts {attempts} of {max}")
}

pub fn reset_mail_resent(attempts: u32, max: u32) -> String {
    format!("Password reset email was sent again. Attempts {attempts} of {max}")
}
