//! Single-use verification tokens: email verification and password reset.
//!
//! Grounded on the `TokenManager`/`TokenError`/`TokenType as
//! VerificationTokenType` re-exports in the teacher's `auth/mod.rs`.
//! Generalized here to back the password-reset flow named in SPEC_FULL
//! §2.2 (present in the data model but not given an operation in the
//! distilled spec). Only the SHA-256 hash of the token is persisted; the
//! raw token is sent to the user once and never stored.

use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationTokenType {
    EmailVerification,
    PasswordReset,
}

impl VerificationTokenType {
    fn lifetime(self) -> Duration {
        match self {
            VerificationTokenType::EmailVerification => Duration::hours(24),
            VerificationTokenType::PasswordReset => Duration::hours(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token is invalid or has expired")]
    Invalid,
}

pub struct IssuedToken {
    pub raw: String,
    pub hash: String,
    pub expires_at: OffsetDateTime,
}

pub struct TokenManager;

impl TokenManager {
    pub fn issue(token_type: VerificationTokenType) -> IssuedToken {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let raw = hex::encode(bytes);
        let hash = Self::hash(&raw);
        IssuedToken {
            raw,
            hash,
            expires_at: OffsetDateTime::now_utc() + token_type.lifetime(),
        }
    }

    pub fn hash(raw: &str) -> String {
        hex::encode(Sha256::digest(raw.as_bytes()))
    }

    pub fn verify(raw: &str, stored_hash: &str, expires_at: OffsetDateTime) -> Result<(), TokenError> {
        if OffsetDateTime::now_utc() > expires_at {
            return Err(TokenError::Invalid);
        }
        if Self::hash(raw) == stored_hash {
            Ok(())
        } else {
            Err(TokenError::Invalid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies_before_expiry() {
        let issued = TokenManager::issue(VerificationTokenType::PasswordReset);
        assert!(TokenManager::verify(&issued.raw, &issued.hash, issued.expires_at).is_ok());
    }

    #[test]
    fn expired_token_is_rejected() {
        let issued = TokenManager::issue(VerificationTokenType::PasswordReset);
        let past = OffsetDateTime::now_utc() - Duration::hours(2);
        assert!(TokenManager::verify(&issued.raw, &issued.hash, past).is_err());
    }

    #[test]
    fn wrong_token_does_not_verify() {
        let issued = TokenManager::issue(VerificationTokenType::EmailVerification);
        assert!(TokenManager::verify("wrong-token", &issued.hash, issued.expires_at).is_err());
    }
}
