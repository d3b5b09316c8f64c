//! Password hashing with Argon2id.
//!
//! Verification failures are indistinguishable by timing: callers that fail
//! before reaching a real hash comparison run [`PasswordHasher::intentional_slowdown`]
//! instead, so the wall clock is dominated by one hash computation on every
//! authentication path.

use super::errors::{AuthError, AuthResult};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};

/// Default time cost for generated password hashes
pub const DEFAULT_COST: u32 = 2;

/// Adaptive-cost password hasher
pub struct PasswordHasher {
    argon2: Argon2<'static>,
    /// Pre-computed hash of a throwaway password, used to equalize the
    /// latency of failing authentication paths. Computed at construction so
    /// its cost always matches the configured cost.
    slowdown_hash: String,
}

impl PasswordHasher {
    /// Create a hasher with the given time cost (0 selects the default)
    pub fn new(cost: u32) -> AuthResult<Self> {
        let cost = if cost == 0 { DEFAULT_COST } else { cost };
        let params = Params::new(Params::DEFAULT_M_COST, cost, Params::DEFAULT_P_COST, None)
            .map_err(|_| AuthError::HashingFailed)?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let salt = SaltString::generate(&mut OsRng);
        let slowdown_hash = argon2
            .hash_password(b"intentional-slow-down", &salt)
            .map_err(|_| AuthError::HashingFailed)?
            .to_string();
        Ok(Self { argon2, slowdown_hash })
    }

    /// Hash a plaintext password into a PHC string
    pub fn hash(&self, password: &str) -> AuthResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        Ok(self
            .argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|_| AuthError::HashingFailed)?
            .to_string())
    }

    /// Verify a plaintext password against a PHC hash. Returns false on any
    /// mismatch or parse failure; the reason is never surfaced.
    pub fn verify(&self, password: &str, hash: &str) -> bool {
        match PasswordHash::new(hash) {
            Ok(parsed) => self.argon2.verify_password(password.as_bytes(), &parsed).is_ok(),
            Err(_) => false,
        }
    }

    /// Burn one hash verification against the pre-computed hash, so callers
    /// that reject a request without a stored hash to compare against take
    /// as long as callers that compare for real.
    pub fn intentional_slowdown(&self) {
        let _ = self.verify("intentional slow-down to avoid timing attacks", &self.slowdown_hash);
    }

    /// Validate that a caller-supplied pre-hashed password is a parseable
    /// PHC string
    pub fn valid_hash(hash: &str) -> AuthResult<()> {
        PasswordHash::new(hash).map_err(|_| AuthError::InvalidPasswordHash)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher() -> PasswordHasher {
        PasswordHasher::new(1).expect("hasher")
    }

    #[test]
    fn test_hash_and_verify() {
        let hasher = hasher();
        let hash = hasher.hash("mypass").expect("hash");
        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify("mypass", &hash));
        assert!(!hasher.verify("wrong", &hash));
        assert!(!hasher.verify("mypass", "not-a-phc-string"));
    }

    #[test]
    fn test_distinct_salts() {
        let hasher = hasher();
        let a = hasher.hash("mypass").expect("hash");
        let b = hasher.hash("mypass").expect("hash");
        assert_ne!(a, b);
        assert!(hasher.verify("mypass", &a));
        assert!(hasher.verify("mypass", &b));
    }

    #[test]
    fn test_valid_hash() {
        let hasher = hasher();
        let hash = hasher.hash("mypass").expect("hash");
        assert!(PasswordHasher::valid_hash(&hash).is_ok());
        assert!(matches!(
            PasswordHasher::valid_hash("mypass"),
            Err(AuthError::InvalidPasswordHash)
        ));
    }
}
