//! Environment-sourced configuration, loaded once at startup.
//!
//! Grounded on the teacher's `Config::from_env()` call site in `main.rs`:
//! every value is read from the process environment (via `dotenvy` in local
//! dev), validated, and a missing or insecure required value fails the
//! process fast with `ConfigRejected` (exit code 2) rather than limping
//! forward with a default that would be wrong in production.

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub bind_addr: String,
    pub jwt_secret: String,
    pub jwt_access_expiry_minutes: i64,
    pub jwt_refresh_expiry_days: i64,
    pub api_key_hmac_secret: String,
    pub totp_encryption_key: String,
    pub allowed_origins: Vec<String>,
    pub mcp_default_request_timeout_ms: u64,
    pub mcp_partial_timeout_ms: u64,
    pub mcp_max_response_bytes: usize,
    pub health_check_interval_secs: u64,
    pub health_check_failure_threshold: u32,
    pub audit_channel_capacity: usize,
    pub rate_limit_default_rpm: u32,
    /// `production` (the fail-safe default) or `development`. Gates the
    /// plain-HTTP rejection on MCP descriptor endpoints — see
    /// `mcp::registry::validate_endpoint`.
    pub environment: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("environment variable {0} has an insecure or invalid value")]
    Insecure(&'static str),
}

/// Placeholder values that show up in READMEs and `.env.example` files.
/// Rejected outright rather than trusted just because they pass the length
/// check.
const INSECURE_SECRET_VALUES: &[&str] = &[
    "changeme",
    "change-me-in-production",
    "secret",
    "your-secret-key-here",
    "development",
    "test-secret-do-not-use-in-production",
];

fn is_known_insecure(value: &str) -> bool {
    INSECURE_SECRET_VALUES.contains(&value.to_ascii_lowercase().as_str())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let jwt_secret = require_env("JWT_SECRET")?;
        if jwt_secret.len() < 32 || is_known_insecure(&jwt_secret) {
            return Err(ConfigError::Insecure("JWT_SECRET"));
        }
        let api_key_hmac_secret = require_env("API_KEY_HMAC_SECRET")?;
        if api_key_hmac_secret.len() < 32 || is_known_insecure(&api_key_hmac_secret) {
            return Err(ConfigError::Insecure("API_KEY_HMAC_SECRET"));
        }
        let totp_encryption_key = require_env("TOTP_ENCRYPTION_KEY")?;
        if totp_encryption_key.len() != 64 || is_known_insecure(&totp_encryption_key) {
            // 32 raw bytes, hex-encoded, for AES-256-GCM.
            return Err(ConfigError::Insecure("TOTP_ENCRYPTION_KEY"));
        }

        Ok(Self {
            database_url: require_env("DATABASE_URL")?,
            database_max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
            bind_addr: env_or_string("BIND_ADDR", "0.0.0.0:8080"),
            jwt_secret,
            jwt_access_expiry_minutes: env_or("JWT_ACCESS_EXPIRY_MINUTES", 15),
            jwt_refresh_expiry_days: env_or("JWT_REFRESH_EXPIRY_DAYS", 30),
            api_key_hmac_secret,
            totp_encryption_key,
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            mcp_default_request_timeout_ms: env_or("MCP_REQUEST_TIMEOUT_MS", 30_000),
            mcp_partial_timeout_ms: env_or("MCP_PARTIAL_TIMEOUT_MS", 10_000),
            mcp_max_response_bytes: env_or("MCP_MAX_RESPONSE_BYTES", 10 * 1024 * 1024),
            health_check_interval_secs: env_or("HEALTH_CHECK_INTERVAL_SECS", 60),
            health_check_failure_threshold: env_or("HEALTH_CHECK_FAILURE_THRESHOLD", 3),
            audit_channel_capacity: env_or("AUDIT_CHANNEL_CAPACITY", 4096),
            rate_limit_default_rpm: env_or("RATE_LIMIT_DEFAULT_RPM", 60),
            environment: env_or_string("ENVIRONMENT", "production"),
        })
    }
}

fn require_env(key: &'static str) -> Result<String, ConfigError> {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn env_or_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn rejects_short_jwt_secret() {
        std::env::set_var("JWT_SECRET", "too-short");
        std::env::set_var("API_KEY_HMAC_SECRET", "x".repeat(32));
        std::env::set_var("TOTP_ENCRYPTION_KEY", "a".repeat(64));
        std::env::set_var("DATABASE_URL", "postgres://localhost/test");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Insecure("JWT_SECRET")));
        std::env::remove_var("JWT_SECRET");
        std::env::remove_var("API_KEY_HMAC_SECRET");
        std::env::remove_var("TOTP_ENCRYPTION_KEY");
        std::env::remove_var("DATABASE_URL");
    }

    #[test]
    #[serial]
    fn missing_database_url_fails_fast() {
        std::env::remove_var("DATABASE_URL");
        std::env::set_var("JWT_SECRET", "x".repeat(32));
        std::env::set_var("API_KEY_HMAC_SECRET", "x".repeat(32));
        std::env::set_var("TOTP_ENCRYPTION_KEY", "a".repeat(64));
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
        std::env::remove_var("JWT_SECRET");
        std::env::remove_var("API_KEY_HMAC_SECRET");
        std::env::remove_var("TOTP_ENCRYPTION_KEY");
    }
}
