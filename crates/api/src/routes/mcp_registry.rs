//! MCP Registry HTTP surface (component C4): `POST/GET/PATCH/DELETE /v1/mcps[/:id]`.
//!
//! Thin handlers over [`crate::mcp::registry`] — every tenant-scoping check
//! lives in that module's `TenantContext`-taking functions, not here. An
//! update bumps the descriptor's `version` column; the proxy engine's
//! [`crate::mcp::pool::ConnectionPool`] keys pooled transports by
//! `(descriptor_id, version)`, so the next acquire after this request
//! discards the stale pooled entry on its own without this handler having
//! to reach into the pool directly.

use axum::extract::{Extension, Path, State};
use axum::Json;
use plexmcp_shared::{PlatformRole, TenantContext};
use uuid::Uuid;

use crate::audit::AuditEvent;
use crate::audit_constants::{action, target_type};
use crate::auth::middleware::AuthUser;
use crate::error::{ApiError, ApiResult, ErrorKind};
use crate::mcp::registry::{self, CreateDescriptor, McpDescriptor, UpdateDescriptor};
use crate::state::AppState;

fn ctx_of(user: &AuthUser) -> ApiResult<TenantContext> {
    let org_id = user
        .require_org_id()
        .map_err(|_| ApiError::new(ErrorKind::Forbidden, "no organization context"))?;
    Ok(TenantContext::new(user.user_id, org_id, PlatformRole::Member))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<McpDescriptor>>> {
    let ctx = ctx_of(&user)?;
    Ok(Json(registry::list(&state.pool, &ctx).await?))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<McpDescriptor>> {
    let ctx = ctx_of(&user)?;
    Ok(Json(registry::get(&state.pool, &ctx, id).await?))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(input): Json<CreateDescriptor>,
) -> ApiResult<Json<McpDescriptor>> {
    let ctx = ctx_of(&user)?;
    let descriptor = registry::create(
        &state.pool,
        &ctx,
        input,
        &state.config.totp_encryption_key,
        &state.config.environment,
    )
    .await?;
    state
        .audit
        .record(
            AuditEvent::new(action::MCP_REGISTERED)
                .org(descriptor.org_id)
                .actor(user.user_id)
                .target(target_type::MCP_DESCRIPTOR, descriptor.id),
        )
        .await;
    Ok(Json(descriptor))
}

pub async fn update(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateDescriptor>,
) -> ApiResult<Json<McpDescriptor>> {
    let ctx = ctx_of(&user)?;
    let descriptor = registry::update(
        &state.pool,
        &ctx,
        id,
        input,
        &state.config.totp_encryption_key,
        &state.config.environment,
    )
    .await?;
    state
        .audit
        .record(
            AuditEvent::new(action::MCP_UPDATED)
                .org(descriptor.org_id)
                .actor(user.user_id)
                .target(target_type::MCP_DESCRIPTOR, descriptor.id),
        )
        .await;
    Ok(Json(descriptor))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<()> {
    let ctx = ctx_of(&user)?;
    registry::soft_delete(&state.pool, &ctx, id).await?;
    let org_id = ctx.org_id()?;
    state
        .audit
        .record(
            AuditEvent::new(action::MCP_DELETED)
                .org(org_id)
                .actor(user.user_id)
                .target(target_type::MCP_DESCRIPTOR, id),
        )
        .await;
    Ok(())
}
