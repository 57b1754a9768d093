//! Password hashing and strength validation (component C2).
//!
//! Grounded on the teacher's re-exports in `auth/mod.rs`
//! (`hash_password`/`verify_password`/`validate_password_strength`/
//! `generate_impossible_hash`) and its Argon2id dependency choice.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("password does not meet strength requirements: {0}")]
    TooWeak(&'static str),
    #[error("password hashing failed")]
    HashFailure,
}

pub fn hash_password(plain: &str) -> Result<String, PasswordError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    argon2
        .hash_password(plain.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| PasswordError::HashFailure)
}

/// Constant-time verification: `PasswordVerifier::verify_password` does not
/// short-circuit on the first mismatched byte, so timing leaks nothing about
/// how much of the candidate matched.
pub fn verify_password(plain: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default().verify_password(plain.as_bytes(), &parsed).is_ok()
}

/// A hash that can never be produced by `hash_password` on any real input,
/// used to populate the `credentials` row for accounts that have no
/// user-supplied password (so verification always fails closed rather than
/// leaving the column nullable and needing a special case at every call
/// site).
pub fn generate_impossible_hash() -> String {
    use rand::RngCore;
    let mut garbage = [0u8; 32];
    OsRng.fill_bytes(&mut garbage);
    format!("$impossible${}", hex::encode(garbage))
}

pub fn validate_password_strength(password: &str) -> Result<(), PasswordError> {
    if password.len() < 12 {
        return Err(PasswordError::TooWeak("must be at least 12 characters"));
    }
    let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if !(has_upper && has_lower && has_digit) {
        return Err(PasswordError::TooWeak(
            "must contain upper, lower, and numeric characters",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_round_trip() {
        let hash = hash_password("Correct-Horse-Battery-9").expect("hash");
        assert!(verify_password("Correct-Horse-Battery-9", &hash));
        assert!(!verify_password("wrong-password", &hash));
    }

    #[test]
    fn impossible_hash_never_verifies() {
        let impossible = generate_impossible_hash();
        assert!(!verify_password("anything", &impossible));
        assert!(!verify_password("", &impossible));
    }

    #[test]
    fn weak_passwords_are_rejected() {
        assert!(validate_password_strength("short1A").is_err());
        assert!(validate_password_strength("alllowercase123").is_err());
        assert!(validate_password_strength("NoDigitsHereAtAll").is_err());
        assert!(validate_password_strength("Valid-Password-123").is_ok());
    }
}
