//! Authentication: passwords, TOTP, API keys, JWTs, sessions, and the Axum
//! middleware that ties them together (components C2/C3).

pub mod api_key;
pub mod jwt;
pub mod middleware;
pub mod password;
pub mod sessions;
pub mod tokens;
pub mod totp;

pub use api_key::{ApiKeyManager, GeneratedApiKey};
pub use jwt::{Claims, JwtError, JwtManager, TokenType};
pub use middleware::{
    optional_auth, require_auth, require_role, AuthError, AuthMethod, AuthState, AuthUser,
};
pub use password::{
    generate_impossible_hash, hash_password, validate_password_strength, verify_password,
};
pub use tokens::{TokenError, TokenManager, VerificationTokenType};
pub use totp::TotpError;
