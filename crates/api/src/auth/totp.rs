//! TOTP second factor and backup codes (component C2/C3).
//!
//! Grounded on the teacher's Cargo.toml dependency choices for this exact
//! purpose (`totp-rs` with `gen_secret`/`otpauth`, `qrcode`, `image` for the
//! enrollment QR, `aes-gcm` for secret-at-rest encryption) and the
//! `TotpError` re-export in `auth/mod.rs`. Secrets are encrypted with
//! AES-256-GCM using a 96-bit random nonce per the spec's credential-store
//! design; the encryption key comes from `Config::totp_encryption_key`
//! (hex-encoded, validated at startup).

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use totp_rs::{Algorithm, Secret, TOTP};

const TOTP_STEP_SECONDS: u64 = 30;
const TOTP_WINDOW_STEPS: i64 = 1;

#[derive(Debug, Error)]
pub enum TotpError {
    #[error("invalid verification code")]
    InvalidCode,
    #[error("encryption failure")]
    Crypto,
    #[error("backup code already used")]
    BackupCodeUsed,
}

pub struct EncryptedSecret {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; 12],
}

/// Encrypt a freshly generated TOTP secret for storage.
pub fn encrypt_secret(raw_secret: &[u8], key_hex: &str) -> Result<EncryptedSecret, TotpError> {
    let key_bytes = hex::decode(key_hex).map_err(|_| TotpError::Crypto)?;
    let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
    let cipher = Aes256Gcm::new(key);

    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, raw_secret)
        .map_err(|_| TotpError::Crypto)?;

    Ok(EncryptedSecret {
        ciphertext,
        nonce: nonce_bytes,
    })
}

pub fn decrypt_secret(encrypted: &EncryptedSecret, key_hex: &str) -> Result<Vec<u8>, TotpError> {
    let key_bytes = hex::decode(key_hex).map_err(|_| TotpError::Crypto)?;
    let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
    let cipher = Aes256Gcm::new(key);
    let nonce = Nonce::from_slice(&encrypted.nonce);
    cipher
        .decrypt(nonce, encrypted.ciphertext.as_ref())
        .map_err(|_| TotpError::Crypto)
}

/// Returns a fresh TOTP instance alongside the raw secret bytes it wraps —
/// callers need the raw bytes to encrypt-at-rest and to build the enrollment
/// QR code, neither of which `totp_rs::TOTP` exposes after construction.
pub fn generate_secret() -> Result<(TOTP, Vec<u8>), TotpError> {
    let secret = Secret::generate_secret();
    let raw = secret.to_bytes().map_err(|_| TotpError::Crypto)?;
    let totp = totp_from_secret(raw.clone())?;
    Ok((totp, raw))
}

/// Rebuilds a `TOTP` instance from a raw secret previously produced by
/// [`generate_secret`] (and persisted, encrypted, in `second_factors`).
pub fn totp_from_secret(raw_secret: Vec<u8>) -> Result<TOTP, TotpError> {
    TOTP::new(
        Algorithm::SHA1,
        6,
        TOTP_WINDOW_STEPS as usize,
        TOTP_STEP_SECONDS,
        raw_secret,
    )
    .map_err(|_| TotpError::Crypto)
}

/// Verify a 6-digit code against the secret, allowing the previous and next
/// 30-second step to absorb clock skew between the agent and the gateway.
pub fn verify_code(totp: &TOTP, code: &str, now_unix: u64) -> Result<(), TotpError> {
    for offset in -TOTP_WINDOW_STEPS..=TOTP_WINDOW_STEPS {
        let ts = now_unix as i64 + offset * TOTP_STEP_SECONDS as i64;
        if ts < 0 {
            continue;
        }
        if totp.generate(ts as u64) == code {
            return Ok(());
        }
    }
    Err(TotpError::InvalidCode)
}

/// Produce `count` single-use backup codes plus their hashes for storage.
/// Only the hashes are persisted; the plaintext codes are returned once to
/// be shown to the user and never stored.
pub fn generate_backup_codes(count: usize) -> Vec<(String, String)> {
    (0..count)
        .map(|_| {
            let mut raw = [0u8; 10];
            OsRng.fill_bytes(&mut raw);
            let code = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw);
            let hash = hash_backup_code(&code);
            (code, hash)
        })
        .collect()
}

pub fn hash_backup_code(code: &str) -> String {
    let digest = Sha256::digest(code.as_bytes());
    hex::encode(digest)
}

/// Constant-time comparison against a stored backup-code hash.
pub fn backup_code_matches(code: &str, stored_hash: &str) -> bool {
    let candidate = hash_backup_code(code);
    let candidate_bytes = candidate.as_bytes();
    let stored_bytes = stored_hash.as_bytes();
    candidate_bytes.len() == stored_bytes.len() && candidate_bytes.ct_eq(stored_bytes).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> String {
        hex::encode([7u8; 32])
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = test_key();
        let secret = b"super-secret-totp-seed";
        let encrypted = encrypt_secret(secret, &key).expect("encrypt");
        let decrypted = decrypt_secret(&encrypted, &key).expect("decrypt");
        assert_eq!(decrypted, secret);
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let encrypted = encrypt_secret(b"seed", &test_key()).expect("encrypt");
        let wrong_key = hex::encode([9u8; 32]);
        assert!(decrypt_secret(&encrypted, &wrong_key).is_err());
    }

    #[test]
    fn generated_secret_verifies_against_its_own_code() {
        let (totp, raw) = generate_secret().expect("generate");
        let rebuilt = totp_from_secret(raw).expect("rebuild");
        let now = 1_700_000_000u64;
        let code = totp.generate(now);
        assert!(verify_code(&rebuilt, &code, now).is_ok());
    }

    #[test]
    fn backup_codes_are_single_use_hashes() {
        let codes = generate_backup_codes(5);
        assert_eq!(codes.len(), 5);
        for (code, hash) in &codes {
            assert!(backup_code_matches(code, hash));
        }
        assert!(!backup_code_matches("not-a-real-code", &codes[0].1));
    }
}
