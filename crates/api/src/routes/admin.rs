//! Platform operator surface (component C9).
//!
//! Grounded on the teacher's `routes/admin_legacy.rs` —
//! `require_platform_admin`'s "query `users.platform_role`, reject below
//! the required rank" shape and `log_admin_action`'s
//! actor/target/before-after/reason audit convention — generalized to run
//! through `plexmcp_shared::TenantContext::require_role`/`with_elevation`
//! instead of a bespoke ad hoc check repeated per handler. Users and
//! sessions are not themselves tenant-bound rows (a `User` belongs to an
//! org only via `Membership`), so operations on them require platform
//! `Admin` rank but no elevation; operations that touch an org's own rows
//! (custom limits, cross-org MCP edits, cross-org ticket assignment)
//! additionally elevate into that org so every such access is audited.

use axum::extract::{Extension, Path, State};
use axum::Json;
use plexmcp_shared::{PlatformRole, TenantContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::AuditEvent;
use crate::audit_constants::{action, severity, target_type};
use crate::auth::middleware::AuthUser;
use crate::auth::sessions;
use crate::error::{ApiError, ApiResult, ErrorKind};
use crate::mcp::registry::{self, McpDescriptor, UpdateDescriptor};
use crate::state::AppState;

async fn operator_ctx(state: &AppState, user: &AuthUser) -> ApiResult<TenantContext> {
    let role: Option<String> = sqlx::query_scalar("select platform_role from users where id = $1")
        .bind(user.user_id)
        .fetch_optional(&state.pool)
        .await?;
    let role = role.ok_or_else(|| ApiError::new(ErrorKind::Unauthorized, "unknown operator"))?;
    let ctx = TenantContext::without_org(user.user_id, PlatformRole::from_str_lenient(&role));
    require_role_audited(state, &ctx, PlatformRole::Admin).await?;
    Ok(ctx)
}

/// Wraps `TenantContext::require_role`, recording a `PERMISSION_DENIED`
/// audit event before the error propagates — a rejected elevation attempt
/// is exactly as interesting as a granted one.
async fn require_role_audited(
    state: &AppState,
    ctx: &TenantContext,
    required: PlatformRole,
) -> ApiResult<()> {
    if let Err(err) = ctx.require_role(required) {
        state
            .audit
            .record(
                AuditEvent::new(action::PERMISSION_DENIED)
                    .actor(ctx.user_id)
                    .severity(severity::WARNING)
                    .details(serde_json::json!({ "required_role": format!("{required:?}") })),
            )
            .await;
        return Err(err.into());
    }
    Ok(())
}

async fn elevate(state: &AppState, ctx: &TenantContext, target_org: Uuid, reason: &str) -> ApiResult<TenantContext> {
    let elevated = ctx.with_elevation(target_org)?;
    state
        .audit
        .record(
            AuditEvent::new(action::ELEVATION_GRANTED)
                .org(target_org)
                .actor(ctx.user_id)
                .severity(severity::WARNING)
                .details(serde_json::json!({ "reason": reason })),
        )
        .await;
    Ok(elevated)
}

// ---------------------------------------------------------------------
// User role / suspension / deletion
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ChangeRoleRequest {
    pub platform_role: String,
    pub reason: String,
}

pub async fn change_role(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(target_user_id): Path<Uuid>,
    Json(req): Json<ChangeRoleRequest>,
) -> ApiResult<()> {
    let ctx = operator_ctx(&state, &user).await?;
    // Elevating an account to `superadmin` is reserved for existing
    // superadmins — an `admin` granting `superadmin` would be a privilege
    // escalation vector.
    if req.platform_role.eq_ignore_ascii_case("superadmin") {
        require_role_audited(&state, &ctx, PlatformRole::Superadmin).await?;
    }

    let old_role: Option<String> = sqlx::query_scalar("select platform_role from users where id = $1")
        .bind(target_user_id)
        .fetch_optional(&state.pool)
        .await?;
    let old_role = old_role.ok_or_else(|| ApiError::new(ErrorKind::NotFound, "user not found"))?;

    sqlx::query("update users set platform_role = $2 where id = $1")
        .bind(target_user_id)
        .bind(&req.platform_role)
        .execute(&state.pool)
        .await?;

    state
        .audit
        .record(
            AuditEvent::new(action::ROLE_CHANGED)
                .actor(ctx.user_id)
                .target(target_type::USER, target_user_id)
                .severity(severity::WARNING)
                .details(serde_json::json!({
                    "old_role": old_role,
                    "new_role": req.platform_role,
                    "reason": req.reason,
                })),
        )
        .await;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct SuspendUserRequest {
    pub reason: String,
}

pub async fn suspend_user(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(target_user_id): Path<Uuid>,
    Json(req): Json<SuspendUserRequest>,
) -> ApiResult<()> {
    let ctx = operator_ctx(&state, &user).await?;
    let result = sqlx::query(
        "update users set is_suspended = true, suspension_reason = $2, suspended_at = now() where id = $1",
    )
    .bind(target_user_id)
    .bind(&req.reason)
    .execute(&state.pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::new(ErrorKind::NotFound, "user not found"));
    }

    sessions::revoke_all_sessions(&state.pool, target_user_id, "account_suspended").await?;

    state
        .audit
        .record(
            AuditEvent::new(action::ORG_SUSPENDED)
                .actor(ctx.user_id)
                .target(target_type::USER, target_user_id)
                .severity(severity::WARNING)
                .details(serde_json::json!({ "reason": req.reason })),
        )
        .await;
    Ok(())
}

pub async fn unsuspend_user(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(target_user_id): Path<Uuid>,
) -> ApiResult<()> {
    let ctx = operator_ctx(&state, &user).await?;
    let result = sqlx::query(
        "update users set is_suspended = false, suspension_reason = null, suspended_at = null where id = $1",
    )
    .bind(target_user_id)
    .execute(&state.pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::new(ErrorKind::NotFound, "user not found"));
    }
    state
        .audit
        .record(
            AuditEvent::new(action::ORG_UNSUSPENDED)
                .actor(ctx.user_id)
                .target(target_type::USER, target_user_id),
        )
        .await;
    Ok(())
}

pub async fn delete_user(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(target_user_id): Path<Uuid>,
) -> ApiResult<()> {
    let ctx = operator_ctx(&state, &user).await?;
    let result = sqlx::query("update users set deleted_at = now() where id = $1 and deleted_at is null")
        .bind(target_user_id)
        .execute(&state.pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::new(ErrorKind::NotFound, "user not found"));
    }
    sessions::revoke_all_sessions(&state.pool, target_user_id, "account_deleted").await?;
    state
        .audit
        .record(
            AuditEvent::new(action::ORG_SOFT_DELETED)
                .actor(ctx.user_id)
                .target(target_type::USER, target_user_id)
                .severity(severity::WARNING),
        )
        .await;
    Ok(())
}

// ---------------------------------------------------------------------
// Session revocation / forced credential reset / 2FA disable
// ---------------------------------------------------------------------

pub async fn revoke_user_sessions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(target_user_id): Path<Uuid>,
) -> ApiResult<()> {
    let ctx = operator_ctx(&state, &user).await?;
    let revoked = sessions::revoke_all_sessions(&state.pool, target_user_id, "admin_revoked").await?;
    state
        .audit
        .record(
            AuditEvent::new(action::SESSION_REVOKED)
                .actor(ctx.user_id)
                .target(target_type::USER, target_user_id)
                .details(serde_json::json!({ "revoked_count": revoked })),
        )
        .await;
    Ok(())
}

/// Rotates the account to an unusable credential — an impossible hash that
/// can never be produced by `hash_password` — and revokes every session,
/// forcing the user through the password-reset flow before they can sign
/// in again.
pub async fn force_password_reset(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(target_user_id): Path<Uuid>,
) -> ApiResult<()> {
    let ctx = operator_ctx(&state, &user).await?;
    let impossible = crate::auth::password::generate_impossible_hash();
    sqlx::query("update credentials set password_hash = $2, updated_at = now() where user_id = $1")
        .bind(target_user_id)
        .bind(&impossible)
        .execute(&state.pool)
        .await?;
    sessions::revoke_all_sessions(&state.pool, target_user_id, "force_password_reset").await?;
    state
        .audit
        .record(
            AuditEvent::new(action::PASSWORD_RESET_COMPLETED)
                .actor(ctx.user_id)
                .target(target_type::USER, target_user_id)
                .severity(severity::WARNING)
                .details(serde_json::json!({ "forced_by_operator": true })),
        )
        .await;
    Ok(())
}

/// Disables 2FA and deletes backup codes and the second-factor secret in
/// one transaction, matching the invariant in spec.md §3 (SecondFactor):
/// "disabling 2FA deletes all backup codes and trusted devices."
pub async fn disable_user_two_factor(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(target_user_id): Path<Uuid>,
) -> ApiResult<()> {
    let ctx = operator_ctx(&state, &user).await?;
    let mut tx = state.pool.begin().await?;
    sqlx::query("delete from second_factors where user_id = $1")
        .bind(target_user_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("delete from backup_codes where user_id = $1")
        .bind(target_user_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    state
        .audit
        .record(
            AuditEvent::new(action::TWO_FACTOR_DISABLED)
                .actor(ctx.user_id)
                .target(target_type::USER, target_user_id)
                .details(serde_json::json!({ "forced_by_operator": true })),
        )
        .await;
    Ok(())
}

// ---------------------------------------------------------------------
// API keys / MCP descriptors across organizations
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RevokeApiKeyRequest {
    pub org_id: Uuid,
    pub reason: String,
}

pub async fn revoke_api_key(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(key_id): Path<Uuid>,
    Json(req): Json<RevokeApiKeyRequest>,
) -> ApiResult<()> {
    let ctx = operator_ctx(&state, &user).await?;
    let _elevated = elevate(&state, &ctx, req.org_id, &req.reason).await?;

    let result = sqlx::query(
        "update api_keys set revoked_at = now() where id = $1 and org_id = $2 and revoked_at is null",
    )
    .bind(key_id)
    .bind(req.org_id)
    .execute(&state.pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::new(ErrorKind::NotFound, "api key not found"));
    }

    state
        .audit
        .record(
            AuditEvent::new(action::API_KEY_REVOKED)
                .org(req.org_id)
                .actor(ctx.user_id)
                .target(target_type::API_KEY, key_id)
                .details(serde_json::json!({ "reason": req.reason })),
        )
        .await;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct AdminUpdateDescriptorRequest {
    pub org_id: Uuid,
    pub reason: String,
    #[serde(flatten)]
    pub update: UpdateDescriptor,
}

pub async fn update_mcp(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(descriptor_id): Path<Uuid>,
    Json(req): Json<AdminUpdateDescriptorRequest>,
) -> ApiResult<Json<McpDescriptor>> {
    let ctx = operator_ctx(&state, &user).await?;
    let elevated = elevate(&state, &ctx, req.org_id, &req.reason).await?;

    let descriptor = registry::update(
        &state.pool,
        &elevated,
        descriptor_id,
        req.update,
        &state.config.totp_encryption_key,
        &state.config.environment,
    )
    .await?;

    state
        .audit
        .record(
            AuditEvent::new(action::MCP_UPDATED)
                .org(req.org_id)
                .actor(ctx.user_id)
                .target(target_type::MCP_DESCRIPTOR, descriptor_id)
                .details(serde_json::json!({ "reason": req.reason })),
        )
        .await;
    Ok(Json(descriptor))
}

// ---------------------------------------------------------------------
// Custom limits
// ---------------------------------------------------------------------

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct OrgLimits {
    pub custom_monthly_limit: Option<i64>,
    pub max_mcps: Option<i32>,
    pub max_api_keys: Option<i32>,
    pub max_team_members: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct SetLimitsRequest {
    pub reason: String,
    pub custom_monthly_limit: Option<i64>,
    pub max_mcps: Option<i32>,
    pub max_api_keys: Option<i32>,
    pub max_team_members: Option<i32>,
}

async fn record_limit_change(
    state: &AppState,
    org_id: Uuid,
    changed_by: Uuid,
    reason: &str,
    field: &str,
    old_value: Value,
    new_value: Value,
) -> ApiResult<()> {
    sqlx::query(
        r#"
        insert into custom_limit_history (org_id, field, old_value, new_value, changed_by, reason)
        values ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(org_id)
    .bind(field)
    .bind(&old_value)
    .bind(&new_value)
    .bind(changed_by)
    .bind(reason)
    .execute(&state.pool)
    .await?;
    Ok(())
}

pub async fn set_limits(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
    Json(req): Json<SetLimitsRequest>,
) -> ApiResult<Json<OrgLimits>> {
    let ctx = operator_ctx(&state, &user).await?;
    let _elevated = elevate(&state, &ctx, org_id, &req.reason).await?;

    let before: OrgLimits = sqlx::query_as(
        "select custom_monthly_limit, max_mcps, max_api_keys, max_team_members from organizations where id = $1",
    )
    .bind(org_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| ApiError::new(ErrorKind::NotFound, "organization not found"))?;

    let after: OrgLimits = sqlx::query_as(
        r#"
        update organizations
        set custom_monthly_limit = coalesce($2, custom_monthly_limit),
            max_mcps = coalesce($3, max_mcps),
            max_api_keys = coalesce($4, max_api_keys),
            max_team_members = coalesce($5, max_team_members)
        where id = $1
        returning custom_monthly_limit, max_mcps, max_api_keys, max_team_members
        "#,
    )
    .bind(org_id)
    .bind(req.custom_monthly_limit)
    .bind(req.max_mcps)
    .bind(req.max_api_keys)
    .bind(req.max_team_members)
    .fetch_one(&state.pool)
    .await?;

    record_limit_change(
        &state,
        org_id,
        ctx.user_id,
        &req.reason,
        "custom_limits",
        serde_json::to_value(&before).unwrap_or_default(),
        serde_json::to_value(&after).unwrap_or_default(),
    )
    .await?;

    state
        .audit
        .record(
            AuditEvent::new(action::CUSTOM_LIMIT_SET)
                .org(org_id)
                .actor(ctx.user_id)
                .details(serde_json::json!({ "reason": req.reason, "before": before, "after": after })),
        )
        .await;

    Ok(Json(after))
}

#[derive(Debug, Deserialize)]
pub struct ClearLimitsRequest {
    pub reason: String,
}

pub async fn clear_limits(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
    Json(req): Json<ClearLimitsRequest>,
) -> ApiResult<()> {
    let ctx = operator_ctx(&state, &user).await?;
    let _elevated = elevate(&state, &ctx, org_id, &req.reason).await?;

    let before: OrgLimits = sqlx::query_as(
        "select custom_monthly_limit, max_mcps, max_api_keys, max_team_members from organizations where id = $1",
    )
    .bind(org_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| ApiError::new(ErrorKind::NotFound, "organization not found"))?;

    sqlx::query(
        "update organizations set custom_monthly_limit = null, max_mcps = null, max_api_keys = null, max_team_members = null where id = $1",
    )
    .bind(org_id)
    .execute(&state.pool)
    .await?;

    record_limit_change(
        &state,
        org_id,
        ctx.user_id,
        &req.reason,
        "custom_limits",
        serde_json::to_value(&before).unwrap_or_default(),
        Value::Null,
    )
    .await?;

    state
        .audit
        .record(
            AuditEvent::new(action::CUSTOM_LIMIT_CLEARED)
                .org(org_id)
                .actor(ctx.user_id)
                .details(serde_json::json!({ "reason": req.reason, "before": before })),
        )
        .await;
    Ok(())
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct LimitHistoryEntry {
    pub id: Uuid,
    pub field: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub changed_by: Uuid,
    pub reason: Option<String>,
    pub created_at: OffsetDateTime,
}

pub async fn limits_history(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<Vec<LimitHistoryEntry>>> {
    let ctx = operator_ctx(&state, &user).await?;
    let _elevated = elevate(&state, &ctx, org_id, "view custom-limit history").await?;

    let rows: Vec<LimitHistoryEntry> = sqlx::query_as(
        r#"
        select id, field, old_value, new_value, changed_by, reason, created_at
        from custom_limit_history
        where org_id = $1
        order by created_at desc
        "#,
    )
    .bind(org_id)
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(rows))
}

// ---------------------------------------------------------------------
// Cross-org support ticket assignment
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AdminAssignTicketRequest {
    pub org_id: Uuid,
    pub assigned_to_user_id: Option<Uuid>,
    pub reason: String,
}

pub async fn assign_ticket(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(ticket_id): Path<Uuid>,
    Json(req): Json<AdminAssignTicketRequest>,
) -> ApiResult<()> {
    let ctx = operator_ctx(&state, &user).await?;
    let _elevated = elevate(&state, &ctx, req.org_id, &req.reason).await?;

    let result = sqlx::query(
        "update support_tickets set assigned_to_user_id = $3, updated_at = now() where id = $1 and org_id = $2",
    )
    .bind(ticket_id)
    .bind(req.org_id)
    .bind(req.assigned_to_user_id)
    .execute(&state.pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::new(ErrorKind::NotFound, "ticket not found"));
    }

    state
        .audit
        .record(
            AuditEvent::new(action::TICKET_ASSIGNED)
                .org(req.org_id)
                .actor(ctx.user_id)
                .target(target_type::SUPPORT_TICKET, ticket_id)
                .details(serde_json::json!({
                    "assigned_to_user_id": req.assigned_to_user_id,
                    "reason": req.reason,
                })),
        )
        .await;
    Ok(())
}
