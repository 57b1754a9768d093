//! API key CRUD surface: `POST/GET/DELETE /v1/api-keys[/:id]`.
//!
//! [SUPPLEMENT] — the data model names `name`, `prefix`, `status`,
//! `created_at`, `last_used_at`, and `request_count` on `ApiKey` but
//! spec.md never enumerates a CRUD surface for them. Grounded on
//! `auth::api_key::ApiKeyManager` (issuance/verification already lives
//! there) and the `api_keys` table's `mcp_access_mode`/`allowed_mcp_ids`/
//! `allow_degraded`/`rate_limit_rpm` scoping columns that
//! `routes::mcp_proxy::resolve_scope` reads at proxy time.

use axum::extract::{Extension, Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::AuditEvent;
use crate::audit_constants::{action, target_type};
use crate::auth::middleware::{require_role, AuthError, AuthUser};
use crate::error::{ApiError, ApiResult, ErrorKind};
use crate::state::AppState;

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ApiKeySummary {
    pub id: Uuid,
    pub name: String,
    pub key_prefix: String,
    pub rate_limit_rpm: i32,
    pub mcp_access_mode: String,
    pub allow_degraded: bool,
    pub revoked_at: Option<OffsetDateTime>,
    pub last_used_at: Option<OffsetDateTime>,
    pub request_count: i64,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub name: String,
    #[serde(default)]
    pub mcp_access_mode: Option<String>,
    #[serde(default)]
    pub allowed_mcp_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub allow_degraded: bool,
    #[serde(default)]
    pub rate_limit_rpm: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct CreateApiKeyResponse {
    /// Shown exactly once; the server never stores or returns this again.
    pub api_key: String,
    pub summary: ApiKeySummary,
}

pub async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<ApiKeySummary>>> {
    let org_id = user
        .require_org_id()
        .map_err(|_| ApiError::new(ErrorKind::Forbidden, "no organization context"))?;
    let rows: Vec<ApiKeySummary> = sqlx::query_as(
        r#"
        select id, name, key_prefix, rate_limit_rpm, mcp_access_mode, allow_degraded,
               revoked_at, last_used_at, request_count, created_at
        from api_keys
        where org_id = $1
        order by created_at desc
        "#,
    )
    .bind(org_id)
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(rows))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CreateApiKeyRequest>,
) -> ApiResult<Json<CreateApiKeyResponse>> {
    require_role(&user, "admin").map_err(ApiErrorFromAuth)?;
    let org_id = user
        .require_org_id()
        .map_err(|_| ApiError::new(ErrorKind::Forbidden, "no organization context"))?;

    let generated = state.api_key_manager.generate_key();
    let mode = req.mcp_access_mode.unwrap_or_else(|| "all".to_string());

    let summary: ApiKeySummary = sqlx::query_as(
        r#"
        insert into api_keys
            (org_id, name, key_prefix, key_hash, mcp_access_mode, allowed_mcp_ids,
             allow_degraded, rate_limit_rpm)
        values ($1, $2, $3, $4, $5, $6, $7, $8)
        returning id, name, key_prefix, rate_limit_rpm, mcp_access_mode, allow_degraded,
                  revoked_at, last_used_at, request_count, created_at
        "#,
    )
    .bind(org_id)
    .bind(&req.name)
    .bind(&generated.prefix)
    .bind(&generated.hash)
    .bind(&mode)
    .bind(&req.allowed_mcp_ids)
    .bind(req.allow_degraded)
    .bind(req.rate_limit_rpm.unwrap_or(60))
    .fetch_one(&state.pool)
    .await?;

    state
        .audit
        .record(
            AuditEvent::new(action::API_KEY_CREATED)
                .org(org_id)
                .actor(user.user_id)
                .target(target_type::API_KEY, summary.id),
        )
        .await;

    Ok(Json(CreateApiKeyResponse {
        api_key: generated.full_key,
        summary,
    }))
}

pub async fn revoke(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<()> {
    require_role(&user, "admin").map_err(ApiErrorFromAuth)?;
    let org_id = user
        .require_org_id()
        .map_err(|_| ApiError::new(ErrorKind::Forbidden, "no organization context"))?;

    let result = sqlx::query(
        "update api_keys set revoked_at = now() where id = $1 and org_id = $2 and revoked_at is null",
    )
    .bind(id)
    .bind(org_id)
    .execute(&state.pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::new(ErrorKind::NotFound, "api key not found"));
    }

    state
        .audit
        .record(
            AuditEvent::new(action::API_KEY_REVOKED)
                .org(org_id)
                .actor(user.user_id)
                .target(target_type::API_KEY, id),
        )
        .await;
    Ok(())
}

/// `auth::middleware::require_role` returns its own `AuthError`; this
/// boundary uses `ApiError` everywhere else, so the two are bridged here
/// rather than letting every handler that checks a membership role repeat
/// the match.
struct ApiErrorFromAuth(AuthError);

impl From<ApiErrorFromAuth> for ApiError {
    fn from(err: ApiErrorFromAuth) -> Self {
        match err.0 {
            AuthError::InsufficientPermissions => {
                ApiError::new(ErrorKind::Forbidden, "insufficient permissions")
            }
            other => ApiError::internal("auth", other),
        }
    }
}
