//! API key issuance and verification (component C2/C3).
//!
//! Grounded on `state.rs::ApiKeyManager::new(&config.api_key_hmac_secret)`
//! and the Cargo.toml deps chosen specifically for this (`hmac`/`sha2`/
//! `hex`/`rand`/`subtle`). Only a salted HMAC of the secret is ever
//! persisted; the full key (`prefix_secret`) is shown to the caller exactly
//! once at creation time.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const PREFIX_LEN: usize = 8;
const SECRET_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct GeneratedApiKey {
    /// Shown to the caller once; never stored.
    pub full_key: String,
    pub prefix: String,
    pub hash: String,
}

#[derive(Clone)]
pub struct ApiKeyManager {
    hmac_secret: Vec<u8>,
}

impl ApiKeyManager {
    pub fn new(hmac_secret: &str) -> Self {
        Self {
            hmac_secret: hmac_secret.as_bytes().to_vec(),
        }
    }

    #[allow(clippy::expect_used)] // HMAC-SHA256 accepts any key length per RFC 2104; this cannot fail.
    pub fn hash_key(&self, full_key: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.hmac_secret).expect("HMAC accepts any key length");
        mac.update(full_key.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Generate a new key: `pmk_<prefix>_<secret>`. The prefix is stored in
    /// the clear as a lookup key (so verification doesn't require scanning
    /// every row); the secret portion is never stored, only its HMAC.
    pub fn generate_key(&self) -> GeneratedApiKey {
        let mut prefix_bytes = [0u8; PREFIX_LEN];
        rand::thread_rng().fill_bytes(&mut prefix_bytes);
        let prefix = hex::encode(prefix_bytes);

        let mut secret_bytes = [0u8; SECRET_BYTES];
        rand::thread_rng().fill_bytes(&mut secret_bytes);
        let secret = hex::encode(secret_bytes);

        let full_key = format!("pmk_{prefix}_{secret}");
        let hash = self.hash_key(&full_key);

        GeneratedApiKey {
            full_key,
            prefix,
            hash,
        }
    }

    pub fn extract_prefix(full_key: &str) -> Option<&str> {
        full_key.strip_prefix("pmk_")?.split('_').next()
    }

    /// Constant-time comparison between a freshly hashed candidate and the
    /// stored hash, so a timing side channel can't be used to guess a valid
    /// key byte by byte.
    pub fn validate_key(&self, full_key: &str, stored_hash: &str) -> bool {
        let candidate = self.hash_key(full_key);
        let candidate_bytes = candidate.as_bytes();
        let stored_bytes = stored_hash.as_bytes();
        candidate_bytes.len() == stored_bytes.len() && candidate_bytes.ct_eq(stored_bytes).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ApiKeyManager {
        ApiKeyManager::new("test-hmac-secret-at-least-32-bytes-long")
    }

    #[test]
    fn generated_key_validates_against_its_own_hash() {
        let mgr = manager();
        let generated = mgr.generate_key();
        assert!(mgr.validate_key(&generated.full_key, &generated.hash));
    }

    #[test]
    fn tampered_key_does_not_validate() {
        let mgr = manager();
        let generated = mgr.generate_key();
        let tampered = format!("{}x", generated.full_key);
        assert!(!mgr.validate_key(&tampered, &generated.hash));
    }

    #[test]
    fn prefix_extraction_matches_generated_prefix() {
        let mgr = manager();
        let generated = mgr.generate_key();
        assert_eq!(
            ApiKeyManager::extract_prefix(&generated.full_key),
            Some(generated.prefix.as_str())
        );
    }

    #[test]
    fn malformed_key_has_no_prefix() {
        assert_eq!(ApiKeyManager::extract_prefix("not-a-key"), None);
    }
}
