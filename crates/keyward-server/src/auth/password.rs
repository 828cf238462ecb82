//! Password hashing and verification using Argon2id
//!
//! Hashing is CPU-bound, so the async entry points on `PasswordService`
//! run it on the blocking pool.

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2, Params,
};
use rand::rngs::OsRng;
use thiserror::Error;

/// Password hashing and verification errors
#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("Failed to hash password: {0}")]
    HashingFailed(String),

    #[error("Failed to verify password: {0}")]
    VerificationFailed(String),

    #[error("Invalid password hash format")]
    InvalidHashFormat,
}

/// Argon2 parameters
#[derive(Debug, Clone)]
pub struct PasswordConfig {
    /// Memory cost in KB (default: 65536 = 64 MB)
    pub memory_cost: u32,
    /// Time cost (iterations, default: 3)
    pub time_cost: u32,
    /// Parallelism (threads, default: 4)
    pub parallelism: u32,
    /// Output length in bytes (default: 32)
    pub output_len: Option<usize>,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            memory_cost: 65536, // 64 MB
            time_cost: 3,
            parallelism: 4,
            output_len: Some(32),
        }
    }
}

impl PasswordConfig {
    /// Cheap parameters for tests
    #[cfg(any(test, feature = "test-utils"))]
    pub fn fast() -> Self {
        Self {
            memory_cost: 1024,
            time_cost: 1,
            parallelism: 1,
            output_len: Some(32),
        }
    }

    fn to_params(&self) -> Result<Params, PasswordError> {
        Params::new(
            self.memory_cost,
            self.time_cost,
            self.parallelism,
            self.output_len,
        )
        .map_err(|e| PasswordError::HashingFailed(e.to_string()))
    }
}

/// Hash a password into a PHC string (algorithm, parameters, salt and hash)
pub fn hash_password_with_config(
    password: &str,
    config: &PasswordConfig,
) -> Result<String, PasswordError> {
    let salt = SaltString::generate(&mut OsRng);
    let params = config.to_params()?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| PasswordError::HashingFailed(e.to_string()))?;

    Ok(password_hash.to_string())
}

/// Verify a plaintext password against a stored hash.
///
/// Parameters are read back from the PHC string; the comparison is constant-time.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, PasswordError> {
    let parsed_hash = PasswordHash::new(hash).map_err(|_| PasswordError::InvalidHashFormat)?;

    match Argon2::default().verify_password(password.as_bytes(), &parsed_hash) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(PasswordError::VerificationFailed(e.to_string())),
    }
}

/// Async front for hashing, shared by the account and recovery services
#[derive(Debug, Clone, Default)]
pub struct PasswordService {
    config: PasswordConfig,
}

impl PasswordService {
    pub fn new(config: PasswordConfig) -> Self {
        Self { config }
    }

    pub async fn hash(&self, password: &str) -> Result<String, PasswordError> {
        let password = password.to_string();
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || hash_password_with_config(&password, &config))
            .await
            .map_err(|e| PasswordError::HashingFailed(format!("hashing task failed: {e}")))?
    }

    pub async fn verify(&self, password: &str, hash: &str) -> Result<bool, PasswordError> {
        let password = password.to_string();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .map_err(|e| {
                PasswordError::VerificationFailed(format!("verification task failed: {e}"))
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify_password() {
        let hash = hash_password_with_config("p1", &PasswordConfig::fast()).unwrap();

        assert!(verify_password("p1", &hash).expect("Verification failed"));
        assert!(!verify_password("p2", &hash).expect("Verification failed"));
    }

    #[test]
    fn test_same_password_produces_different_hashes() {
        let config = PasswordConfig::fast();
        let hash1 = hash_password_with_config("SamePassword123!", &config).unwrap();
        let hash2 = hash_password_with_config("SamePassword123!", &config).unwrap();

        assert_ne!(hash1, hash2);
        assert!(verify_password("SamePassword123!", &hash1).unwrap());
        assert!(verify_password("SamePassword123!", &hash2).unwrap());
    }

    #[test]
    fn test_invalid_hash_format() {
        let result = verify_password("password", "invalid-hash-format");
        assert!(matches!(result, Err(PasswordError::InvalidHashFormat)));
    }

    #[test]
    fn test_custom_config_in_phc_string() {
        let config = PasswordConfig {
            memory_cost: 2048,
            time_cost: 2,
            parallelism: 1,
            output_len: Some(32),
        };
        let hash = hash_password_with_config("TestPassword123!", &config).unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(hash.contains("m=2048"));
        assert!(hash.contains("t=2"));
        assert!(verify_password("TestPassword123!", &hash).unwrap());
    }

    #[tokio::test]
    async fn test_service_runs_on_blocking_pool() {
        let service = PasswordService::new(PasswordConfig::fast());
        let hash = service.hash("p1").await.unwrap();

        assert!(service.verify("p1", &hash).await.unwrap());
        assert!(!service.verify("wrong", &hash).await.unwrap());
    }
}
