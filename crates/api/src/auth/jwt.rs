//! JWT session tokens (component C3).
//!
//! Grounded on `state.rs::JwtManager::new`/`with_supabase_secret` and
//! `auth/middleware.rs::authenticate_jwt`. The Supabase-JWT fallback path
//! the teacher supports is dropped — Supabase-hosted OAuth ingress is a
//! dashboard-side concern out of scope here — leaving the direct PlexMCP
//! JWT half of that function, generalized into the sole authentication path.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
    /// Issued after first-factor success, before 2FA is verified; scoped
    /// narrowly so it cannot be used against any endpoint but
    /// `POST /v1/auth/2fa`.
    TwoFactorPending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub jti: Uuid,
    pub org_id: Option<Uuid>,
    pub token_type: TokenType,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("token is invalid or expired")]
    Invalid,
    #[error("token type mismatch: expected {expected:?}")]
    WrongType { expected: TokenType },
}

#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_expiry: Duration,
    refresh_expiry: Duration,
}

impl JwtManager {
    pub fn new(secret: &str, access_expiry_minutes: i64, refresh_expiry_days: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            access_expiry: Duration::minutes(access_expiry_minutes),
            refresh_expiry: Duration::days(refresh_expiry_days),
        }
    }

    fn issue(&self, user_id: Uuid, org_id: Option<Uuid>, token_type: TokenType) -> Result<(String, Uuid, OffsetDateTime), JwtError> {
        let now = OffsetDateTime::now_utc();
        let expiry = match token_type {
            TokenType::Access => self.access_expiry,
            TokenType::Refresh => self.refresh_expiry,
            TokenType::TwoFactorPending => Duration::minutes(5),
        };
        let exp_at = now + expiry;
        let jti = Uuid::new_v4();
        let claims = Claims {
            sub: user_id,
            jti,
            org_id,
            token_type,
            exp: exp_at.unix_timestamp(),
            iat: now.unix_timestamp(),
        };
        let token = encode(&Header::default(), &claims, &self.encoding_key).map_err(|_| JwtError::Invalid)?;
        Ok((token, jti, exp_at))
    }

    pub fn issue_access_token(&self, user_id: Uuid, org_id: Uuid) -> Result<(String, Uuid, OffsetDateTime), JwtError> {
        self.issue(user_id, Some(org_id), TokenType::Access)
    }

    pub fn issue_refresh_token(&self, user_id: Uuid, org_id: Uuid) -> Result<(String, Uuid, OffsetDateTime), JwtError> {
        self.issue(user_id, Some(org_id), TokenType::Refresh)
    }

    pub fn issue_two_factor_pending_token(&self, user_id: Uuid) -> Result<(String, Uuid, OffsetDateTime), JwtError> {
        self.issue(user_id, None, TokenType::TwoFactorPending)
    }

    fn decode_any(&self, token: &str) -> Result<Claims, JwtError> {
        let validation = Validation::default();
        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|_| JwtError::Invalid)
    }

    pub fn validate_access_token(&self, token: &str) -> Result<Claims, JwtError> {
        let claims = self.decode_any(token)?;
        if claims.token_type != TokenType::Access {
            return Err(JwtError::WrongType {
                expected: TokenType::Access,
            });
        }
        Ok(claims)
    }

    pub fn validate_refresh_token(&self, token: &str) -> Result<Claims, JwtError> {
        let claims = self.decode_any(token)?;
        if claims.token_type != TokenType::Refresh {
            return Err(JwtError::WrongType {
                expected: TokenType::Refresh,
            });
        }
        Ok(claims)
    }

    pub fn validate_two_factor_pending_token(&self, token: &str) -> Result<Claims, JwtError> {
        let claims = self.decode_any(token)?;
        if claims.token_type != TokenType::TwoFactorPending {
            return Err(JwtError::WrongType {
                expected: TokenType::TwoFactorPending,
            });
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> JwtManager {
        JwtManager::new("test-jwt-secret-at-least-32-bytes", 15, 30)
    }

    #[test]
    fn access_token_round_trips() {
        let mgr = manager();
        let user_id = Uuid::new_v4();
        let org_id = Uuid::new_v4();
        let (token, jti, _) = mgr.issue_access_token(user_id, org_id).expect("issue");
        let claims = mgr.validate_access_token(&token).expect("validate");
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.jti, jti);
        assert_eq!(claims.org_id, Some(org_id));
    }

    #[test]
    fn refresh_token_rejected_by_access_validator() {
        let mgr = manager();
        let (token, _, _) = mgr
            .issue_refresh_token(Uuid::new_v4(), Uuid::new_v4())
            .expect("issue");
        assert!(matches!(
            mgr.validate_access_token(&token),
            Err(JwtError::WrongType { .. })
        ));
    }

    #[test]
    fn two_factor_pending_token_has_no_org() {
        let mgr = manager();
        let (token, _, _) = mgr
            .issue_two_factor_pending_token(Uuid::new_v4())
            .expect("issue");
        let claims = mgr.validate_two_factor_pending_token(&token).expect("validate");
        assert_eq!(claims.org_id, None);
    }
}
