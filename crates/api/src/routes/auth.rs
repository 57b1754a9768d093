//! Authentication HTTP surface (components C2/C3): registration, login,
//! second-factor verification, token refresh, logout, session management,
//! password reset, and TOTP enrollment.
//!
//! New construction — the teacher keeps this logic split across Supabase
//! webhooks and dashboard-side handlers that assume an external identity
//! provider. Grounded on the primitives the teacher does own outright and
//! that already live in this crate: `auth::jwt`, `auth::password`,
//! `auth::sessions`, `auth::tokens`, `auth::totp`, and the lockout tracking
//! in `auth::middleware::AuthState`.

use std::io::Cursor;

use axum::extract::{Extension, Path, State};
use axum::http::HeaderMap;
use axum::Json;
use base64::Engine;
use image::{ImageFormat, Luma};
use qrcode::QrCode;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::AuditEvent;
use crate::audit_constants::{action, severity, target_type};
use crate::auth::middleware::{extract_ip_address, AuthUser};
use crate::auth::totp::EncryptedSecret;
use crate::auth::{password, sessions, tokens, totp};
use crate::error::{ApiError, ApiResult, ErrorKind};
use crate::state::AppState;

fn lockout_key(email: &str, ip: Option<&str>) -> String {
    format!("{email}:{}", ip.unwrap_or("unknown"))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub org_name: String,
}

#[derive(Debug, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: OffsetDateTime,
}

/// Creates the account, its organization, and an owner membership in one
/// transaction, then signs the caller in immediately — there is no separate
/// email-verification gate here since outbound mail delivery is out of
/// scope for this gateway.
pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<Json<TokenPair>> {
    password::validate_password_strength(&req.password)
        .map_err(|e| ApiError::new(ErrorKind::ConfigRejected, e.to_string()))?;
    let password_hash = password::hash_password(&req.password)
        .map_err(|e| ApiError::internal("register_hash", e))?;

    let mut tx = state.pool.begin().await?;

    let existing: Option<(bool,)> = sqlx::query_as("select true from users where email = $1")
        .bind(&req.email)
        .fetch_optional(&mut *tx)
        .await?;
    if existing.is_some() {
        return Err(ApiError::new(ErrorKind::Conflict, "an account with this email already exists"));
    }

    let user_id: Uuid = sqlx::query_scalar(
        "insert into users (email, platform_role) values ($1, 'member') returning id",
    )
    .bind(&req.email)
    .fetch_one(&mut *tx)
    .await?;

    let org_id: Uuid = sqlx::query_scalar("insert into organizations (name) values ($1) returning id")
        .bind(&req.org_name)
        .fetch_one(&mut *tx)
        .await?;

    sqlx::query("insert into memberships (org_id, user_id, role) values ($1, $2, 'owner')")
        .bind(org_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("insert into credentials (user_id, password_hash) values ($1, $2)")
        .bind(user_id)
        .bind(&password_hash)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    let pair = issue_session(&state, user_id, org_id, extract_ip_address(&headers).as_deref(), user_agent(&headers).as_deref()).await?;

    state
        .audit
        .record(
            AuditEvent::new(action::LOGIN_SUCCEEDED)
                .org(org_id)
                .actor(user_id)
                .details(serde_json::json!({"reason": "registration"})),
        )
        .await;

    Ok(Json(pair))
}

fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers.get("user-agent").and_then(|v| v.to_str().ok()).map(str::to_string)
}

async fn issue_session(
    state: &AppState,
    user_id: Uuid,
    org_id: Uuid,
    ip_address: Option<&str>,
    user_agent: Option<&str>,
) -> ApiResult<TokenPair> {
    let (access_token, access_jti, access_expires_at) =
        state.jwt_manager.issue_access_token(user_id, org_id).map_err(|e| ApiError::internal("issue_access", e))?;
    let (refresh_token, refresh_jti, refresh_expires_at) =
        state.jwt_manager.issue_refresh_token(user_id, org_id).map_err(|e| ApiError::internal("issue_refresh", e))?;

    sessions::save_session(
        &state.pool,
        user_id,
        access_jti,
        access_expires_at,
        refresh_jti,
        refresh_expires_at,
        ip_address,
        user_agent,
    )
    .await?;

    Ok(TokenPair {
        access_token,
        refresh_token,
        access_expires_at,
    })
}

#[derive(sqlx::FromRow)]
struct LoginRow {
    id: Uuid,
    password_hash: String,
    is_suspended: bool,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum LoginResponse {
    Tokens(TokenPair),
    TwoFactorRequired { requires_2fa: bool, temp_token: String },
}

pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let ip = extract_ip_address(&headers);
    let key = lockout_key(&req.email, ip.as_deref());
    let auth_state = state.auth_state();

    if auth_state.is_locked_out(&key).await {
        return Err(ApiError::new(
            ErrorKind::RateLimited,
            "too many failed login attempts, try again later",
        ));
    }

    let row: Option<LoginRow> = sqlx::query_as(
        r#"
        select u.id, c.password_hash, u.is_suspended
        from users u
        join credentials c on c.user_id = u.id
        where u.email = $1 and u.deleted_at is null
        "#,
    )
    .bind(&req.email)
    .fetch_optional(&state.pool)
    .await?;

    let Some(row) = row else {
        auth_state.record_login_failure(&key).await;
        state.audit.record(AuditEvent::new(action::LOGIN_FAILED).details(serde_json::json!({"email": req.email}))).await;
        return Err(ApiError::new(ErrorKind::Unauthorized, "invalid credentials"));
    };

    if !password::verify_password(&req.password, &row.password_hash) {
        auth_state.record_login_failure(&key).await;
        state
            .audit
            .record(AuditEvent::new(action::LOGIN_FAILED).actor(row.id).details(serde_json::json!({"email": req.email})))
            .await;
        return Err(ApiError::new(ErrorKind::Unauthorized, "invalid credentials"));
    }

    if row.is_suspended {
        return Err(ApiError::new(ErrorKind::Forbidden, "account is suspended"));
    }

    auth_state.clear_login_failures(&key).await;

    let second_factor_enabled: Option<(bool,)> =
        sqlx::query_as("select enabled from second_factors where user_id = $1")
            .bind(row.id)
            .fetch_optional(&state.pool)
            .await?;

    if second_factor_enabled.map(|(enabled,)| enabled).unwrap_or(false) {
        let (temp_token, _, _) = state
            .jwt_manager
            .issue_two_factor_pending_token(row.id)
            .map_err(|e| ApiError::internal("issue_2fa_pending", e))?;
        return Ok(Json(LoginResponse::TwoFactorRequired {
            requires_2fa: true,
            temp_token,
        }));
    }

    let org_id = first_org_for_user(&state.pool, row.id).await?;
    let pair = issue_session(&state, row.id, org_id, ip.as_deref(), user_agent(&headers).as_deref()).await?;
    touch_last_login(&state.pool, row.id).await;
    state.audit.record(AuditEvent::new(action::LOGIN_SUCCEEDED).org(org_id).actor(row.id)).await;

    Ok(Json(LoginResponse::Tokens(pair)))
}

async fn first_org_for_user(pool: &PgPool, user_id: Uuid) -> ApiResult<Uuid> {
    let org_id: Option<(Uuid,)> = sqlx::query_as(
        "select org_id from memberships where user_id = $1 order by created_at asc limit 1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    org_id
        .map(|(id,)| id)
        .ok_or_else(|| ApiError::new(ErrorKind::Forbidden, "account has no organization membership"))
}

async fn touch_last_login(pool: &PgPool, user_id: Uuid) {
    let _ = sqlx::query("update users set last_login_at = now() where id = $1")
        .bind(user_id)
        .execute(pool)
        .await;
}

#[derive(Debug, Deserialize)]
pub struct VerifyTwoFactorRequest {
    pub temp_token: String,
    pub code: Option<String>,
    pub backup_code: Option<String>,
}

pub async fn verify_two_factor(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<VerifyTwoFactorRequest>,
) -> ApiResult<Json<TokenPair>> {
    let claims = state
        .jwt_manager
        .validate_two_factor_pending_token(&req.temp_token)
        .map_err(|_| ApiError::new(ErrorKind::Unauthorized, "two-factor session expired, log in again"))?;
    let user_id = claims.sub;
    let auth_state = state.auth_state();

    #[derive(sqlx::FromRow)]
    struct SecondFactorRow {
        totp_secret_encrypted: Vec<u8>,
        totp_nonce: Vec<u8>,
    }

    let row: Option<SecondFactorRow> = sqlx::query_as(
        "select totp_secret_encrypted, totp_nonce from second_factors where user_id = $1 and enabled = true",
    )
    .bind(user_id)
    .fetch_optional(&state.pool)
    .await?;
    let row = row.ok_or_else(|| ApiError::new(ErrorKind::TwoFactorRequired, "two-factor is not enabled"))?;

    let verified = match (&req.code, &req.backup_code) {
        (Some(code), _) => {
            let encrypted = EncryptedSecret {
                ciphertext: row.totp_secret_encrypted,
                nonce: row
                    .totp_nonce
                    .try_into()
                    .map_err(|_| ApiError::internal("2fa_verify", "corrupt totp nonce"))?,
            };
            let secret = totp::decrypt_secret(&encrypted, &state.config.totp_encryption_key)
                .map_err(|e| ApiError::internal("2fa_verify", e))?;
            let totp = totp::totp_from_secret(secret).map_err(|e| ApiError::internal("2fa_verify", e))?;
            let now = OffsetDateTime::now_utc().unix_timestamp() as u64;
            totp::verify_code(&totp, code, now).is_ok()
        }
        (None, Some(backup_code)) => consume_backup_code(&state.pool, user_id, backup_code).await?,
        (None, None) => false,
    };

    if !verified {
        let locked = auth_state.record_two_factor_failure(user_id).await;
        state
            .audit
            .record(
                AuditEvent::new(action::LOGIN_FAILED)
                    .actor(user_id)
                    .severity(severity::WARNING)
                    .details(serde_json::json!({"reason": "two_factor_invalid"})),
            )
            .await;

        if locked {
            sqlx::query(
                "update users set is_suspended = true, suspension_reason = $2, suspended_at = now() where id = $1",
            )
            .bind(user_id)
            .bind("too many invalid two-factor codes")
            .execute(&state.pool)
            .await?;
            sessions::revoke_all_sessions(&state.pool, user_id, "two_factor_lockout").await?;
            state
                .audit
                .record(
                    AuditEvent::new(action::ACCOUNT_LOCKED)
                        .actor(user_id)
                        .severity(severity::CRITICAL)
                        .details(serde_json::json!({"reason": "two_factor_invalid_attempts_exceeded"})),
                )
                .await;
            return Err(ApiError::new(
                ErrorKind::Forbidden,
                "account locked after too many invalid two-factor codes",
            ));
        }

        return Err(ApiError::new(ErrorKind::TwoFactorInvalid, "invalid verification code"));
    }

    auth_state.clear_two_factor_failures(user_id).await;
    let org_id = first_org_for_user(&state.pool, user_id).await?;
    let pair = issue_session(&state, user_id, org_id, extract_ip_address(&headers).as_deref(), user_agent(&headers).as_deref()).await?;
    touch_last_login(&state.pool, user_id).await;
    state.audit.record(AuditEvent::new(action::LOGIN_SUCCEEDED).org(org_id).actor(user_id)).await;

    Ok(Json(pair))
}

async fn consume_backup_code(pool: &PgPool, user_id: Uuid, code: &str) -> ApiResult<bool> {
    #[derive(sqlx::FromRow)]
    struct BackupCodeRow {
        id: Uuid,
        code_hash: String,
    }
    let candidates: Vec<BackupCodeRow> =
        sqlx::query_as("select id, code_hash from backup_codes where user_id = $1 and used_at is null")
            .bind(user_id)
            .fetch_all(pool)
            .await?;

    for candidate in candidates {
        if totp::backup_code_matches(code, &candidate.code_hash) {
            sqlx::query("update backup_codes set used_at = now() where id = $1")
                .bind(candidate.id)
                .execute(pool)
                .await?;
            return Ok(true);
        }
    }
    Ok(false)
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> ApiResult<Json<TokenPair>> {
    let claims = state
        .jwt_manager
        .validate_refresh_token(&req.refresh_token)
        .map_err(|_| ApiError::new(ErrorKind::Unauthorized, "invalid or expired refresh token"))?;

    if !sessions::is_session_valid(&state.pool, claims.jti, claims.sub).await? {
        return Err(ApiError::new(ErrorKind::Unauthorized, "session has been revoked"));
    }
    let org_id = claims.org_id.ok_or_else(|| ApiError::new(ErrorKind::Unauthorized, "refresh token missing organization"))?;

    let refresh_session_id: Option<(Uuid,)> = sqlx::query_as(
        "select id from user_sessions where jti = $1 and token_type = 'refresh'",
    )
    .bind(claims.jti)
    .fetch_optional(&state.pool)
    .await?;
    let refresh_session_id = refresh_session_id
        .map(|(id,)| id)
        .ok_or_else(|| ApiError::new(ErrorKind::Unauthorized, "refresh session not found"))?;

    let (access_token, access_jti, access_expires_at) = state
        .jwt_manager
        .issue_access_token(claims.sub, org_id)
        .map_err(|e| ApiError::internal("refresh_issue", e))?;

    sqlx::query(
        r#"
        insert into user_sessions (user_id, jti, expires_at, token_type, parent_session_id)
        values ($1, $2, $3, 'access', $4)
        "#,
    )
    .bind(claims.sub)
    .bind(access_jti)
    .bind(access_expires_at)
    .bind(refresh_session_id)
    .execute(&state.pool)
    .await?;

    sessions::touch_last_used(&state.pool, claims.jti).await?;
    state.audit.record(AuditEvent::new(action::TOKEN_REFRESHED).org(org_id).actor(claims.sub)).await;

    Ok(Json(TokenPair {
        access_token,
        refresh_token: req.refresh_token,
        access_expires_at,
    }))
}

pub async fn logout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<()> {
    if let Some(session_id) = user.session_id {
        sessions::revoke_session(&state.pool, session_id, "user_logout").await?;
    }
    state
        .audit
        .record(AuditEvent::new(action::LOGOUT).actor(user.user_id).details(serde_json::json!({})))
        .await;
    Ok(())
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<sessions::UserSession>>> {
    Ok(Json(sessions::list_sessions(&state.pool, user.user_id).await?))
}

pub async fn revoke_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(jti): Path<Uuid>,
) -> ApiResult<()> {
    let owned: Option<(bool,)> =
        sqlx::query_as("select true from user_sessions where jti = $1 and user_id = $2")
            .bind(jti)
            .bind(user.user_id)
            .fetch_optional(&state.pool)
            .await?;
    if owned.is_none() {
        return Err(ApiError::new(ErrorKind::NotFound, "session not found"));
    }
    sessions::revoke_session(&state.pool, jti, "user_revoked").await?;
    state
        .audit
        .record(AuditEvent::new(action::SESSION_REVOKED).actor(user.user_id).target(target_type::SESSION, jti))
        .await;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct PasswordResetRequest {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct PasswordResetRequestResponse {
    /// Returned directly rather than emailed: outbound mail delivery is out
    /// of scope for this gateway. A real deployment would front this
    /// endpoint with a notification service and drop this field.
    pub reset_token: Option<String>,
}

/// Reset requests are rate-limited per account (spec §4.3), reusing the
/// same token-bucket primitive `mcp_proxy` uses for per-key request limits
/// rather than standing up separate anti-abuse infrastructure. Keyed under
/// a nil org id since the bucket's key space is `(org_id, subject_id)` and
/// password reset has no org context.
const PASSWORD_RESET_LIMIT_PER_MINUTE: u32 = 3;

pub async fn request_password_reset(
    State(state): State<AppState>,
    Json(req): Json<PasswordResetRequest>,
) -> ApiResult<Json<PasswordResetRequestResponse>> {
    let user_id: Option<(Uuid,)> = sqlx::query_as("select id from users where email = $1 and deleted_at is null")
        .bind(&req.email)
        .fetch_optional(&state.pool)
        .await?;

    // Same response whether or not the email exists, so the endpoint can't
    // be used to enumerate registered accounts.
    let Some((user_id,)) = user_id else {
        return Ok(Json(PasswordResetRequestResponse { reset_token: None }));
    };

    if let plexmcp_shared::RateLimitDecision::Rejected { retry_after_seconds } = state.rate_limiter.check_api_key(
        Uuid::nil(),
        user_id,
        PASSWORD_RESET_LIMIT_PER_MINUTE,
    ) {
        return Err(ApiError::new(
            ErrorKind::RateLimited,
            format!("too many reset requests, retry after {retry_after_seconds}s"),
        ));
    }

    let issued = tokens::TokenManager::issue(tokens::VerificationTokenType::PasswordReset);
    sqlx::query(
        r#"
        insert into verification_tokens (user_id, token_type, token_hash, expires_at)
        values ($1, 'password_reset', $2, $3)
        "#,
    )
    .bind(user_id)
    .bind(&issued.hash)
    .bind(issued.expires_at)
    .execute(&state.pool)
    .await?;

    state
        .audit
        .record(AuditEvent::new(action::PASSWORD_RESET_REQUESTED).actor(user_id))
        .await;

    Ok(Json(PasswordResetRequestResponse {
        reset_token: Some(issued.raw),
    }))
}

#[derive(Debug, Deserialize)]
pub struct PasswordResetCompleteRequest {
    pub token: String,
    pub new_password: String,
}

pub async fn complete_password_reset(
    State(state): State<AppState>,
    Json(req): Json<PasswordResetCompleteRequest>,
) -> ApiResult<()> {
    password::validate_password_strength(&req.new_password)
        .map_err(|e| ApiError::new(ErrorKind::ConfigRejected, e.to_string()))?;

    let hash = tokens::TokenManager::hash(&req.token);
    #[derive(sqlx::FromRow)]
    struct TokenRow {
        id: Uuid,
        user_id: Uuid,
        expires_at: OffsetDateTime,
    }
    let row: Option<TokenRow> = sqlx::query_as(
        "select id, user_id, expires_at from verification_tokens where token_hash = $1 and token_type = 'password_reset' and used_at is null",
    )
    .bind(&hash)
    .fetch_optional(&state.pool)
    .await?;
    let row = row.ok_or_else(|| ApiError::new(ErrorKind::Unauthorized, "invalid or expired token"))?;

    if tokens::TokenManager::verify(&req.token, &hash, row.expires_at).is_err() {
        return Err(ApiError::new(ErrorKind::Unauthorized, "invalid or expired token"));
    }

    let new_hash = password::hash_password(&req.new_password).map_err(|e| ApiError::internal("reset_hash", e))?;

    sqlx::query("update credentials set password_hash = $1, updated_at = now() where user_id = $2")
        .bind(&new_hash)
        .bind(row.user_id)
        .execute(&state.pool)
        .await?;
    sqlx::query("update verification_tokens set used_at = now() where id = $1")
        .bind(row.id)
        .execute(&state.pool)
        .await?;
    sqlx::query("update users set password_changed_at = now() where id = $1")
        .bind(row.user_id)
        .execute(&state.pool)
        .await?;
    sessions::revoke_all_sessions(&state.pool, row.user_id, "password_reset").await?;

    state
        .audit
        .record(AuditEvent::new(action::PASSWORD_RESET_COMPLETED).actor(row.user_id))
        .await;

    Ok(())
}

#[derive(Debug, Serialize)]
pub struct EnableTwoFactorResponse {
    pub otpauth_url: String,
    pub qr_code_png_base64: String,
}

/// Generates a fresh TOTP secret and stores it encrypted but disabled;
/// [`confirm_two_factor`] must verify one code against it before it
/// protects the account.
pub async fn enable_two_factor(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<EnableTwoFactorResponse>> {
    let (_totp, secret_bytes) = totp::generate_secret().map_err(|e| ApiError::internal("2fa_enable", e))?;

    let encrypted = totp::encrypt_secret(&secret_bytes, &state.config.totp_encryption_key)
        .map_err(|e| ApiError::internal("2fa_enable", e))?;

    sqlx::query(
        r#"
        insert into second_factors (user_id, totp_secret_encrypted, totp_nonce, enabled)
        values ($1, $2, $3, false)
        on conflict (user_id) do update set
            totp_secret_encrypted = excluded.totp_secret_encrypted,
            totp_nonce = excluded.totp_nonce,
            enabled = false
        "#,
    )
    .bind(user.user_id)
    .bind(&encrypted.ciphertext)
    .bind(encrypted.nonce.as_slice())
    .execute(&state.pool)
    .await?;

    let otpauth_url = build_otpauth_url(&secret_bytes, &user.user_id.to_string());
    let qr_code_png_base64 = qr_png_base64(&otpauth_url)?;

    Ok(Json(EnableTwoFactorResponse {
        otpauth_url,
        qr_code_png_base64,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ConfirmTwoFactorRequest {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct ConfirmTwoFactorResponse {
    pub backup_codes: Vec<String>,
}

pub async fn confirm_two_factor(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<ConfirmTwoFactorRequest>,
) -> ApiResult<Json<ConfirmTwoFactorResponse>> {
    #[derive(sqlx::FromRow)]
    struct SecondFactorRow {
        totp_secret_encrypted: Vec<u8>,
        totp_nonce: Vec<u8>,
    }
    let row: Option<SecondFactorRow> =
        sqlx::query_as("select totp_secret_encrypted, totp_nonce from second_factors where user_id = $1")
            .bind(user.user_id)
            .fetch_optional(&state.pool)
            .await?;
    let row = row.ok_or_else(|| ApiError::new(ErrorKind::Conflict, "call enable before confirm"))?;

    let encrypted = EncryptedSecret {
        ciphertext: row.totp_secret_encrypted,
        nonce: row
            .totp_nonce
            .try_into()
            .map_err(|_| ApiError::internal("2fa_confirm", "corrupt totp nonce"))?,
    };
    let secret = totp::decrypt_secret(&encrypted, &state.config.totp_encryption_key)
        .map_err(|e| ApiError::internal("2fa_confirm", e))?;
    let totp_instance = totp::totp_from_secret(secret).map_err(|e| ApiError::internal("2fa_confirm", e))?;
    let now = OffsetDateTime::now_utc().unix_timestamp() as u64;
    if totp::verify_code(&totp_instance, &req.code, now).is_err() {
        return Err(ApiError::new(ErrorKind::TwoFactorInvalid, "invalid verification code"));
    }

    sqlx::query("update second_factors set enabled = true where user_id = $1")
        .bind(user.user_id)
        .execute(&state.pool)
        .await?;

    let codes = totp::generate_backup_codes(10);
    for (_, hash) in &codes {
        sqlx::query("insert into backup_codes (user_id, code_hash) values ($1, $2)")
            .bind(user.user_id)
            .bind(hash)
            .execute(&state.pool)
            .await?;
    }

    state
        .audit
        .record(AuditEvent::new(action::TWO_FACTOR_ENABLED).actor(user.user_id))
        .await;

    Ok(Json(ConfirmTwoFactorResponse {
        backup_codes: codes.into_iter().map(|(raw, _)| raw).collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct DisableTwoFactorRequest {
    pub password: String,
}

pub async fn disable_two_factor(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<DisableTwoFactorRequest>,
) -> ApiResult<()> {
    let stored_hash: Option<(String,)> = sqlx::query_as("select password_hash from credentials where user_id = $1")
        .bind(user.user_id)
        .fetch_optional(&state.pool)
        .await?;
    let stored_hash = stored_hash.ok_or_else(|| ApiError::new(ErrorKind::Unauthorized, "invalid credentials"))?;
    if !password::verify_password(&req.password, &stored_hash.0) {
        return Err(ApiError::new(ErrorKind::Unauthorized, "invalid credentials"));
    }

    sqlx::query("update second_factors set enabled = false, totp_secret_encrypted = '', totp_nonce = '' where user_id = $1")
        .bind(user.user_id)
        .execute(&state.pool)
        .await?;
    sqlx::query("delete from backup_codes where user_id = $1")
        .bind(user.user_id)
        .execute(&state.pool)
        .await?;

    state
        .audit
        .record(AuditEvent::new(action::TWO_FACTOR_DISABLED).actor(user.user_id))
        .await;

    Ok(())
}

/// Hand-rolled RFC 4648 base32 (no padding) for the `secret=` query param —
/// kept local rather than pulling in a base32 crate for one call site.
fn base32_encode(bytes: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut output = String::new();
    let mut buffer: u32 = 0;
    let mut bits_in_buffer = 0u32;
    for &byte in bytes {
        buffer = (buffer << 8) | byte as u32;
        bits_in_buffer += 8;
        while bits_in_buffer >= 5 {
            bits_in_buffer -= 5;
            let index = ((buffer >> bits_in_buffer) & 0x1f) as usize;
            output.push(ALPHABET[index] as char);
        }
    }
    if bits_in_buffer > 0 {
        let index = ((buffer << (5 - bits_in_buffer)) & 0x1f) as usize;
        output.push(ALPHABET[index] as char);
    }
    output
}

fn build_otpauth_url(secret: &[u8], account_label: &str) -> String {
    let encoded_secret = base32_encode(secret);
    format!(
        "otpauth://totp/PlexMCP:{account_label}?secret={encoded_secret}&issuer=PlexMCP&digits=6&period=30&algorithm=SHA1"
    )
}

fn qr_png_base64(data: &str) -> ApiResult<String> {
    let code = QrCode::new(data.as_bytes()).map_err(|e| ApiError::internal("qr_encode", e))?;
    let image_buffer = code.render::<Luma<u8>>().build();
    let mut png_bytes: Vec<u8> = Vec::new();
    image_buffer
        .write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)
        .map_err(|e| ApiError::internal("qr_png_encode", e))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(png_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base32_round_trip_length_matches_rfc4648() {
        let encoded = base32_encode(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(encoded.len(), 7);
        assert!(encoded.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn otpauth_url_carries_issuer_and_secret() {
        let url = build_otpauth_url(b"seed-bytes", "user@example.com");
        assert!(url.starts_with("otpauth://totp/PlexMCP:user@example.com?"));
        assert!(url.contains("issuer=PlexMCP"));
    }

    #[test]
    fn lockout_key_combines_email_and_ip() {
        assert_eq!(lockout_key("a@b.com", Some("1.2.3.4")), "a@b.com:1.2.3.4");
        assert_eq!(lockout_key("a@b.com", None), "a@b.com:unknown");
    }
}
