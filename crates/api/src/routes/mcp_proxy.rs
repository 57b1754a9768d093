//! MCP-over-HTTPS proxy endpoint (component C7): `POST /v1/mcp`.
//!
//! The single door every aggregated tool call, resource read, and prompt
//! fetch passes through: rate limit, quota admission, dispatch via
//! [`McpProxyHandler`], then usage/audit bookkeeping on the way out. A
//! request that never reaches dispatch (locked out by the rate limiter or
//! denied by quota) never touches the upstream and is never counted or
//! audited as a proxied call.
//!
//! `McpFilter` is this module's contract with `mcp::handlers` — it is
//! constructed here from the presenting credential's scope and threaded
//! through unchanged. JWT-authenticated dashboard callers (used for
//! "test this MCP" flows in the UI) get the unrestricted default; API keys
//! carry their own `mcp_access_mode`/`allowed_mcp_ids`/`allow_degraded`
//! scope, set at creation time and editable later (component C4).

use axum::extract::{Extension, State};
use axum::Json;
use sqlx::PgPool;
use uuid::Uuid;

use plexmcp_quota::{AdmissionDecision, SpendCapCheck};
use plexmcp_shared::{RateLimitDecision, SubscriptionTier};

use crate::audit::AuditEvent;
use crate::audit_constants::{action, severity, target_type};
use crate::auth::middleware::{AuthMethod, AuthUser};
use crate::error::{ApiError, ApiResult, ErrorKind};
use crate::mcp::handlers::McpProxyHandler;
use crate::mcp::types::{JsonRpcRequest, JsonRpcResponse};
use crate::state::AppState;

/// Which descriptors a request may reach. `mode` mirrors the registry's own
/// filter vocabulary (`all`, `selected`, `none`) rather than a closed enum,
/// since it is read straight out of the `api_keys.mcp_access_mode` column.
#[derive(Debug, Clone)]
pub struct McpFilter {
    pub mode: String,
    pub allowed_ids: Option<Vec<Uuid>>,
    pub allow_degraded: bool,
}

impl McpFilter {
    pub fn all() -> Self {
        Self {
            mode: "all".to_string(),
            allowed_ids: None,
            allow_degraded: false,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ApiKeyScopeRow {
    mcp_access_mode: String,
    allowed_mcp_ids: Option<Vec<Uuid>>,
    allow_degraded: bool,
    rate_limit_rpm: i32,
}

/// Resolves the filter and the rate-limit bucket size for the presenting
/// credential. JWT callers are treated as unrestricted, full-rate dashboard
/// traffic; API keys carry their own scope and per-key rate limit.
async fn resolve_scope(pool: &PgPool, user: &AuthUser, default_rpm: u32) -> ApiResult<(McpFilter, u32)> {
    let AuthMethod::ApiKey { key_id } = user.auth_method else {
        return Ok((McpFilter::all(), default_rpm));
    };

    let row: Option<ApiKeyScopeRow> = sqlx::query_as(
        r#"
        select mcp_access_mode, allowed_mcp_ids, allow_degraded, rate_limit_rpm
        from api_keys
        where id = $1 and revoked_at is null
        "#,
    )
    .bind(key_id)
    .fetch_optional(pool)
    .await?;

    let row = row.ok_or_else(|| ApiError::new(ErrorKind::Unauthorized, "api key no longer valid"))?;
    let rpm = if row.rate_limit_rpm > 0 {
        row.rate_limit_rpm as u32
    } else {
        default_rpm
    };

    Ok((
        McpFilter {
            mode: row.mcp_access_mode,
            allowed_ids: row.allowed_mcp_ids,
            allow_degraded: row.allow_degraded,
        },
        rpm,
    ))
}

#[derive(sqlx::FromRow)]
struct OrgBillingRow {
    subscription_tier: String,
    custom_monthly_limit: Option<i64>,
    overage_rate_cents: i32,
    is_suspended: bool,
}

pub async fn proxy(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<JsonRpcRequest>,
) -> ApiResult<Json<JsonRpcResponse>> {
    let org_id = user
        .require_org_id()
        .map_err(|_| ApiError::new(ErrorKind::Forbidden, "no organization context"))?;

    let org: Option<OrgBillingRow> = sqlx::query_as(
        r#"
        select subscription_tier, custom_monthly_limit, overage_rate_cents, is_suspended
        from organizations
        where id = $1 and deleted_at is null
        "#,
    )
    .bind(org_id)
    .fetch_optional(&state.pool)
    .await?;
    let org = org.ok_or_else(|| ApiError::new(ErrorKind::NotFound, "organization not found"))?;
    if org.is_suspended {
        return Err(ApiError::new(ErrorKind::Forbidden, "organization is suspended"));
    }

    let (filter, rpm) = resolve_scope(&state.pool, &user, state.config.rate_limit_default_rpm).await?;

    let rate_limit_key = match user.auth_method {
        AuthMethod::ApiKey { key_id } => key_id,
        AuthMethod::Jwt => user.user_id,
    };
    match state.rate_limiter.check_api_key(org_id, rate_limit_key, rpm) {
        RateLimitDecision::Allowed { .. } => {}
        RateLimitDecision::Rejected { retry_after_seconds } => {
            return Err(ApiError::new(
                ErrorKind::RateLimited,
                format!("rate limit exceeded, retry after {retry_after_seconds}s"),
            ));
        }
    }

    let tier = SubscriptionTier::from_str_lenient(&org.subscription_tier);
    match state
        .usage_meter
        .check_admission(org_id, tier, org.custom_monthly_limit)
        .await?
    {
        AdmissionDecision::Admitted { .. } => {}
        AdmissionDecision::AdmittedOverage { overage_units } => {
            if let SpendCapCheck::Paused { cap_amount_cents } = state.spend_cap.check(org_id).await? {
                return Err(ApiError::new(
                    ErrorKind::QuotaExceeded,
                    format!("spend cap of {cap_amount_cents} cents reached for this billing period"),
                ));
            }
            if org.overage_rate_cents > 0 {
                let amount_cents = overage_units * org.overage_rate_cents as i64;
                state.spend_cap.record_overage_spend(org_id, amount_cents).await?;
            }
        }
        AdmissionDecision::Denied { effective_limit } => {
            return Err(ApiError::new(
                ErrorKind::QuotaExceeded,
                format!("monthly request limit of {effective_limit} reached"),
            ));
        }
    }

    let handler = McpProxyHandler::new(
        state.pool.clone(),
        state.config.clone(),
        state.mcp_client.clone(),
        state.connection_pool.clone(),
    );

    let method = request.method.clone();
    let tracked = handler.handle_request_filtered(org_id, request, filter).await;

    // Only meter requests that actually reached an upstream dispatch. A
    // request rejected before a descriptor was chosen (not found, unhealthy,
    // payload too large) leaves `accessed_mcp_ids` empty and must not
    // increment the monthly counter — see the error taxonomy this mirrors.
    if !tracked.accessed_mcp_ids.is_empty() {
        if let Err(err) = state.usage_meter.record_completed_request(org_id).await {
            tracing::error!(error = %err, %org_id, "failed to record completed mcp request");
        }
    }

    let had_error = tracked.response.error.is_some();
    let mut event = AuditEvent::new(action::MCP_REQUEST_PROXIED)
        .org(org_id)
        .severity(if had_error { severity::WARNING } else { severity::INFO })
        .details(serde_json::json!({
            "method": method,
            "accessed_mcp_ids": tracked.accessed_mcp_ids,
            "had_error": had_error,
        }));
    if user.user_id != Uuid::nil() {
        event = event.actor(user.user_id);
    }
    if let [only] = tracked.accessed_mcp_ids.as_slice() {
        event = event.target(target_type::MCP_DESCRIPTOR, *only);
    }
    state.audit.record(event).await;

    Ok(Json(tracked.response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_filter_is_unrestricted() {
        let filter = McpFilter::all();
        assert_eq!(filter.mode, "all");
        assert!(filter.allowed_ids.is_none());
        assert!(!filter.allow_degraded);
    }
}
