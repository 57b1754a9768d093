//! Session persistence and revocation (component C3).
//!
//! Adapted directly from the teacher's file of the same name: the max-
//! sessions-per-user eviction, parent/child refresh-access session linkage,
//! and revocation/listing queries are kept essentially unchanged, retyped
//! from string JTIs to `Uuid` to match `auth::jwt::Claims::jti`.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ApiResult;

/// Caps concurrent sessions per user; prevents unbounded session
/// accumulation from becoming an attack surface of its own.
const MAX_SESSIONS_PER_USER: i64 = 10;

#[allow(clippy::too_many_arguments)]
pub async fn save_session(
    pool: &PgPool,
    user_id: Uuid,
    access_jti: Uuid,
    access_expires_at: OffsetDateTime,
    refresh_jti: Uuid,
    refresh_expires_at: OffsetDateTime,
    ip_address: Option<&str>,
    user_agent: Option<&str>,
) -> ApiResult<()> {
    let mut tx = pool.begin().await?;

    let session_count: (i64,) = sqlx::query_as(
        r#"
        select count(*)
        from user_sessions
        where user_id = $1
          and revoked_at is null
          and expires_at > now()
          and token_type = 'refresh'
        "#,
    )
    .bind(user_id)
    .fetch_one(&mut *tx)
    .await?;

    if session_count.0 >= MAX_SESSIONS_PER_USER {
        tracing::info!(
            user_id = %user_id,
            current_sessions = session_count.0,
            max_sessions = MAX_SESSIONS_PER_USER,
            "revoking oldest session due to max sessions limit"
        );

        sqlx::query(
            r#"
            update user_sessions
            set revoked_at = now(),
                revocation_reason = 'max_sessions_exceeded'
            where id in (
                select id from user_sessions
                where user_id = $1
                  and revoked_at is null
                  and token_type = 'refresh'
                order by created_at asc
                limit 1
            )
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    }

    let refresh_session_id: Uuid = sqlx::query_scalar(
        r#"
        insert into user_sessions (user_id, jti, expires_at, ip_address, user_agent, token_type)
        values ($1, $2, $3, $4, $5, 'refresh')
        returning id
        "#,
    )
    .bind(user_id)
    .bind(refresh_jti)
    .bind(refresh_expires_at)
    .bind(ip_address)
    .bind(user_agent)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        insert into user_sessions
            (user_id, jti, expires_at, ip_address, user_agent, token_type, parent_session_id)
        values ($1, $2, $3, $4, $5, 'access', $6)
        "#,
    )
    .bind(user_id)
    .bind(access_jti)
    .bind(access_expires_at)
    .bind(ip_address)
    .bind(user_agent)
    .bind(refresh_session_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Called by the auth middleware on every request; confirms ownership, not
/// just existence, so a JTI issued for one user can never be replayed
/// against another's account.
pub async fn is_session_valid(pool: &PgPool, jti: Uuid, expected_user_id: Uuid) -> ApiResult<bool> {
    let result: Option<(bool,)> = sqlx::query_as(
        r#"
        select true
        from user_sessions
        where jti = $1
          and user_id = $2
          and revoked_at is null
          and expires_at > now()
        "#,
    )
    .bind(jti)
    .bind(expected_user_id)
    .fetch_optional(pool)
    .await?;

    Ok(result.is_some())
}

pub async fn touch_last_used(pool: &PgPool, jti: Uuid) -> ApiResult<()> {
    sqlx::query("update user_sessions set last_used_at = now() where jti = $1")
        .bind(jti)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn revoke_session(pool: &PgPool, jti: Uuid, reason: &str) -> ApiResult<bool> {
    let rows_affected = sqlx::query(
        r#"
        update user_sessions
        set revoked_at = now(), revocation_reason = $2
        where jti = $1 and revoked_at is null
        "#,
    )
    .bind(jti)
    .bind(reason)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(rows_affected > 0)
}

pub async fn revoke_all_sessions(pool: &PgPool, user_id: Uuid, reason: &str) -> ApiResult<u64> {
    let rows_affected = sqlx::query(
        r#"
        update user_sessions
        set revoked_at = now(), revocation_reason = $2
        where user_id = $1 and revoked_at is null
        "#,
    )
    .bind(user_id)
    .bind(reason)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(rows_affected)
}

#[derive(Debug, sqlx::FromRow, serde::Serialize)]
pub struct UserSession {
    pub id: Uuid,
    pub jti: Uuid,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub last_used_at: OffsetDateTime,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub token_type: String,
}

pub async fn list_sessions(pool: &PgPool, user_id: Uuid) -> ApiResult<Vec<UserSession>> {
    let sessions = sqlx::query_as::<_, UserSession>(
        r#"
        select id, jti, created_at, expires_at, last_used_at, ip_address, user_agent, token_type
        from user_sessions
        where user_id = $1
          and revoked_at is null
          and expires_at > now()
          and token_type = 'refresh'
        order by created_at desc
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(sessions)
}

#[cfg(test)]
mod tests {
    #[allow(unused_imports)]
    use super::*;

    #[test]
    fn max_sessions_constant_is_positive() {
        assert!(MAX_SESSIONS_PER_USER > 0);
    }
}
