//! MCP Registry: CRUD on `McpDescriptor` rows (component C4).
//!
//! Grounded on the teacher's `mcp::handlers::McpProxyHandler::load_mcps_filtered`
//! query shape, generalized from its ad hoc JSONB `config` blob into the
//! explicit `auth_scheme` enum from [`super::types::AuthScheme`]. Secret
//! material is encrypted with AES-256-GCM before it ever reaches a `bind`
//! call, reusing the same key and cipher the TOTP store uses
//! ([`crate::auth::totp`]) rather than inventing a second scheme. Every
//! mutation bumps `version`, which is what invalidates entries in
//! [`super::pool::ConnectionPool`].

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use plexmcp_shared::TenantContext;

use super::types::AuthScheme;
use crate::error::{ApiError, ApiResult, ErrorKind};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("descriptor secret encryption failed")]
    Crypto,
    #[error("endpoint url is not a valid url")]
    InvalidUrl,
    #[error("plain http endpoints are rejected outside development")]
    InsecureScheme,
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidUrl | RegistryError::InsecureScheme => {
                ApiError::new(ErrorKind::Conflict, err.to_string())
            }
            RegistryError::Crypto => ApiError::internal("mcp_registry", err),
        }
    }
}

/// Endpoint invariant from the descriptor data model: the URL must parse,
/// and a production deployment refuses plain `http://` — only `stdio`
/// transports (no `endpoint_url` at all) and explicit `https://` pass.
fn validate_endpoint(transport: &str, endpoint_url: Option<&str>, environment: &str) -> Result<(), RegistryError> {
    if transport == "stdio" {
        return Ok(());
    }
    let raw = endpoint_url.ok_or(RegistryError::InvalidUrl)?;
    let parsed = url::Url::parse(raw).map_err(|_| RegistryError::InvalidUrl)?;
    if environment != "development" && parsed.scheme() != "https" {
        return Err(RegistryError::InsecureScheme);
    }
    Ok(())
}

/// Encrypt a plaintext upstream credential for storage. Returns the raw
/// column values `(ciphertext, nonce)` as stored in `mcp_descriptors`.
pub fn encrypt_descriptor_secret(key_hex: &str, plaintext: &str) -> Result<(Vec<u8>, Vec<u8>), RegistryError> {
    let key_bytes = hex::decode(key_hex).map_err(|_| RegistryError::Crypto)?;
    let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
    let cipher = Aes256Gcm::new(key);

    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| RegistryError::Crypto)?;
    Ok((ciphertext, nonce_bytes.to_vec()))
}

/// Decrypt a descriptor's stored upstream credential. Used by the health
/// checker and the proxy engine to recover the secret just before
/// forwarding a request; never surfaced back through an HTTP response.
pub fn decrypt_descriptor_secret(key_hex: &str, ciphertext: &[u8], nonce: &[u8]) -> Result<String, RegistryError> {
    let key_bytes = hex::decode(key_hex).map_err(|_| RegistryError::Crypto)?;
    let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
    let cipher = Aes256Gcm::new(key);
    let nonce = Nonce::from_slice(nonce);
    let plaintext = cipher.decrypt(nonce, ciphertext).map_err(|_| RegistryError::Crypto)?;
    String::from_utf8(plaintext).map_err(|_| RegistryError::Crypto)
}

/// Public-facing shape of an `McpDescriptor`. Never carries the decrypted
/// secret or the raw ciphertext/nonce columns.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct McpDescriptor {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub transport: String,
    pub endpoint_url: Option<String>,
    pub command: Option<String>,
    pub args: Option<serde_json::Value>,
    pub env: Option<serde_json::Value>,
    pub auth_scheme: String,
    pub request_timeout_ms: i32,
    pub partial_timeout_ms: i32,
    pub version: i64,
    pub health_state: String,
    pub consecutive_failures: i32,
    pub last_latency_ms: Option<i32>,
    pub protocol_version: Option<String>,
    pub server_name: Option<String>,
    pub server_version: Option<String>,
    pub discovered_tools: Option<serde_json::Value>,
    pub discovered_resources: Option<serde_json::Value>,
    pub discovered_prompts: Option<serde_json::Value>,
    pub created_at: time::OffsetDateTime,
}

const DESCRIPTOR_COLUMNS: &str = r#"
    id, org_id, name, transport, endpoint_url, command, args, env, auth_scheme,
    request_timeout_ms, partial_timeout_ms, version, health_state,
    consecutive_failures, last_latency_ms, protocol_version, server_name,
    server_version, discovered_tools, discovered_resources,
    discovered_prompts, created_at
"#;

#[derive(Debug, Deserialize)]
pub struct CreateDescriptor {
    pub name: String,
    pub transport: String,
    pub endpoint_url: Option<String>,
    pub command: Option<String>,
    pub args: Option<serde_json::Value>,
    pub env: Option<serde_json::Value>,
    #[serde(default)]
    pub auth_scheme: AuthScheme,
    /// Plaintext upstream credential, if any. Encrypted before the insert
    /// and never echoed back.
    pub auth_secret: Option<String>,
    pub request_timeout_ms: Option<i32>,
    pub partial_timeout_ms: Option<i32>,
}

impl Default for AuthScheme {
    fn default() -> Self {
        AuthScheme::None
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateDescriptor {
    pub name: Option<String>,
    pub endpoint_url: Option<String>,
    pub command: Option<String>,
    pub args: Option<serde_json::Value>,
    pub env: Option<serde_json::Value>,
    pub auth_scheme: Option<AuthScheme>,
    pub auth_secret: Option<String>,
    pub request_timeout_ms: Option<i32>,
    pub partial_timeout_ms: Option<i32>,
}

pub async fn list(pool: &PgPool, ctx: &TenantContext) -> ApiResult<Vec<McpDescriptor>> {
    let org_id = ctx.org_id()?;
    let query = format!(
        "select {DESCRIPTOR_COLUMNS} from mcp_descriptors where org_id = $1 and deleted_at is null order by created_at desc"
    );
    let rows = sqlx::query_as::<_, McpDescriptor>(&query)
        .bind(org_id)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn get(pool: &PgPool, ctx: &TenantContext, id: Uuid) -> ApiResult<McpDescriptor> {
    let org_id = ctx.org_id()?;
    let query = format!(
        "select {DESCRIPTOR_COLUMNS} from mcp_descriptors where id = $1 and deleted_at is null"
    );
    let row = sqlx::query_as::<_, McpDescriptor>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::new(ErrorKind::NotFound, "mcp descriptor not found"))?;
    ctx.assert_scope(row.org_id)
        .map_err(|_| ApiError::new(ErrorKind::NotFound, "mcp descriptor not found"))?;
    let _ = org_id;
    Ok(row)
}

pub async fn create(
    pool: &PgPool,
    ctx: &TenantContext,
    input: CreateDescriptor,
    totp_key: &str,
    environment: &str,
) -> ApiResult<McpDescriptor> {
    let org_id = ctx.org_id()?;

    validate_endpoint(&input.transport, input.endpoint_url.as_deref(), environment)?;

    let (ciphertext, nonce) = match &input.auth_secret {
        Some(secret) if !secret.is_empty() => {
            let (c, n) = encrypt_descriptor_secret(totp_key, secret)?;
            (Some(c), Some(n))
        }
        _ => (None, None),
    };

    let query = format!(
        r#"
        insert into mcp_descriptors
            (org_id, name, transport, endpoint_url, command, args, env,
             auth_scheme, auth_secret_encrypted, auth_nonce,
             request_timeout_ms, partial_timeout_ms)
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        returning {DESCRIPTOR_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, McpDescriptor>(&query)
        .bind(org_id)
        .bind(&input.name)
        .bind(&input.transport)
        .bind(&input.endpoint_url)
        .bind(&input.command)
        .bind(&input.args)
        .bind(&input.env)
        .bind(input.auth_scheme.as_str())
        .bind(ciphertext)
        .bind(nonce)
        .bind(input.request_timeout_ms.unwrap_or(30_000))
        .bind(input.partial_timeout_ms.unwrap_or(10_000))
        .fetch_one(pool)
        .await?;
    Ok(row)
}

/// Applies only the fields present in `input`; every update bumps `version`
/// by one regardless of which fields changed, so the connection pool always
/// discards a potentially-stale pooled transport on the next acquire.
pub async fn update(
    pool: &PgPool,
    ctx: &TenantContext,
    id: Uuid,
    input: UpdateDescriptor,
    totp_key: &str,
    environment: &str,
) -> ApiResult<McpDescriptor> {
    let existing = get(pool, ctx, id).await?;

    let name = input.name.unwrap_or(existing.name);
    let endpoint_url = input.endpoint_url.or(existing.endpoint_url);
    validate_endpoint(&existing.transport, endpoint_url.as_deref(), environment)?;
    let command = input.command.or(existing.command);
    let args = input.args.or(existing.args);
    let env = input.env.or(existing.env);
    let auth_scheme = input
        .auth_scheme
        .map(|s| s.as_str().to_string())
        .unwrap_or(existing.auth_scheme);
    let request_timeout_ms = input.request_timeout_ms.unwrap_or(existing.request_timeout_ms);
    let partial_timeout_ms = input.partial_timeout_ms.unwrap_or(existing.partial_timeout_ms);

    let secret_update = match &input.auth_secret {
        Some(secret) if !secret.is_empty() => Some(encrypt_descriptor_secret(totp_key, secret)?),
        _ => None,
    };

    let query = if let Some((ciphertext, nonce)) = secret_update {
        let query = format!(
            r#"
            update mcp_descriptors
            set name = $2, endpoint_url = $3, command = $4, args = $5, env = $6,
                auth_scheme = $7, request_timeout_ms = $8, partial_timeout_ms = $9,
                auth_secret_encrypted = $10, auth_nonce = $11, version = version + 1
            where id = $1
            returning {DESCRIPTOR_COLUMNS}
            "#
        );
        sqlx::query_as::<_, McpDescriptor>(&query)
            .bind(id)
            .bind(&name)
            .bind(&endpoint_url)
            .bind(&command)
            .bind(&args)
            .bind(&env)
            .bind(&auth_scheme)
            .bind(request_timeout_ms)
            .bind(partial_timeout_ms)
            .bind(ciphertext)
            .bind(nonce)
            .fetch_one(pool)
            .await?
    } else {
        let query = format!(
            r#"
            update mcp_descriptors
            set name = $2, endpoint_url = $3, command = $4, args = $5, env = $6,
                auth_scheme = $7, request_timeout_ms = $8, partial_timeout_ms = $9,
                version = version + 1
            where id = $1
            returning {DESCRIPTOR_COLUMNS}
            "#
        );
        sqlx::query_as::<_, McpDescriptor>(&query)
            .bind(id)
            .bind(&name)
            .bind(&endpoint_url)
            .bind(&command)
            .bind(&args)
            .bind(&env)
            .bind(&auth_scheme)
            .bind(request_timeout_ms)
            .bind(partial_timeout_ms)
            .fetch_one(pool)
            .await?
    };

    Ok(query)
}

pub async fn soft_delete(pool: &PgPool, ctx: &TenantContext, id: Uuid) -> ApiResult<()> {
    let _ = get(pool, ctx, id).await?;
    sqlx::query("update mcp_descriptors set deleted_at = now() where id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> String {
        hex::encode([3u8; 32])
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = test_key();
        let (ciphertext, nonce) = encrypt_descriptor_secret(&key, "upstream-bearer-token").expect("encrypt");
        let decrypted = decrypt_descriptor_secret(&key, &ciphertext, &nonce).expect("decrypt");
        assert_eq!(decrypted, "upstream-bearer-token");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let (ciphertext, nonce) = encrypt_descriptor_secret(&test_key(), "secret").expect("encrypt");
        let wrong_key = hex::encode([4u8; 32]);
        assert!(decrypt_descriptor_secret(&wrong_key, &ciphertext, &nonce).is_err());
    }

    #[test]
    fn stdio_transport_skips_url_validation() {
        assert!(validate_endpoint("stdio", None, "production").is_ok());
    }

    #[test]
    fn production_rejects_plain_http() {
        let err = validate_endpoint("http", Some("http://upstream.internal/mcp"), "production").unwrap_err();
        assert!(matches!(err, RegistryError::InsecureScheme));
    }

    #[test]
    fn production_accepts_https() {
        assert!(validate_endpoint("http", Some("https://upstream.internal/mcp"), "production").is_ok());
    }

    #[test]
    fn development_allows_plain_http() {
        assert!(validate_endpoint("http", Some("http://localhost:9000/mcp"), "development").is_ok());
    }

    #[test]
    fn malformed_url_is_rejected() {
        let err = validate_endpoint("http", Some("not a url"), "production").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidUrl));
    }

    #[test]
    fn missing_endpoint_for_http_transport_is_rejected() {
        let err = validate_endpoint("http", None, "production").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidUrl));
    }
}
