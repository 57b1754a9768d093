//! Support ticket HTTP surface — tenant-scoped reads and assignment writes
//! only. `SupportTicket` is specified as an interface: everything else
//! (triage workflow, the real-time WebSocket channel) lives in the external
//! support subsystem this gateway does not own.

use axum::extract::{Extension, Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::AuditEvent;
use crate::audit_constants::{action, target_type};
use crate::auth::middleware::{require_role, AuthUser};
use crate::error::{ApiError, ApiResult, ErrorKind};
use crate::state::AppState;

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct SupportTicket {
    pub id: Uuid,
    pub org_id: Uuid,
    pub opened_by_user_id: Uuid,
    pub assigned_to_user_id: Option<Uuid>,
    pub subject: String,
    pub status: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Deserialize)]
pub struct ListTicketsQuery {
    pub status: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ListTicketsQuery>,
) -> ApiResult<Json<Vec<SupportTicket>>> {
    let org_id = user
        .require_org_id()
        .map_err(|_| ApiError::new(ErrorKind::Forbidden, "no organization context"))?;

    let rows: Vec<SupportTicket> = sqlx::query_as(
        r#"
        select id, org_id, opened_by_user_id, assigned_to_user_id, subject, status,
               created_at, updated_at
        from support_tickets
        where org_id = $1 and ($2::text is null or status = $2)
        order by created_at desc
        "#,
    )
    .bind(org_id)
    .bind(query.status)
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct CreateTicketRequest {
    pub subject: String,
}

pub async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CreateTicketRequest>,
) -> ApiResult<Json<SupportTicket>> {
    let org_id = user
        .require_org_id()
        .map_err(|_| ApiError::new(ErrorKind::Forbidden, "no organization context"))?;

    let ticket: SupportTicket = sqlx::query_as(
        r#"
        insert into support_tickets (org_id, opened_by_user_id, subject)
        values ($1, $2, $3)
        returning id, org_id, opened_by_user_id, assigned_to_user_id, subject, status,
                  created_at, updated_at
        "#,
    )
    .bind(org_id)
    .bind(user.user_id)
    .bind(&req.subject)
    .fetch_one(&state.pool)
    .await?;
    Ok(Json(ticket))
}

#[derive(Debug, Deserialize)]
pub struct AssignTicketRequest {
    pub assigned_to_user_id: Option<Uuid>,
}

/// Assignment is an operator action (staff/admin), not a tenant self-serve
/// one — a member can open and read their org's tickets but cannot route
/// them to a support engineer.
pub async fn assign(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<AssignTicketRequest>,
) -> ApiResult<Json<SupportTicket>> {
    require_role(&user, "admin").map_err(|_| ApiError::new(ErrorKind::Forbidden, "insufficient permissions"))?;
    let org_id = user
        .require_org_id()
        .map_err(|_| ApiError::new(ErrorKind::Forbidden, "no organization context"))?;

    let ticket: Option<SupportTicket> = sqlx::query_as(
        r#"
        update support_tickets
        set assigned_to_user_id = $3, updated_at = now()
        where id = $1 and org_id = $2
        returning id, org_id, opened_by_user_id, assigned_to_user_id, subject, status,
                  created_at, updated_at
        "#,
    )
    .bind(id)
    .bind(org_id)
    .bind(req.assigned_to_user_id)
    .fetch_optional(&state.pool)
    .await?;

    let ticket = ticket.ok_or_else(|| ApiError::new(ErrorKind::NotFound, "ticket not found"))?;

    state
        .audit
        .record(
            AuditEvent::new(action::TICKET_ASSIGNED)
                .org(org_id)
                .actor(user.user_id)
                .target(target_type::SUPPORT_TICKET, id)
                .details(serde_json::json!({ "assigned_to_user_id": req.assigned_to_user_id })),
        )
        .await;

    Ok(Json(ticket))
}
