// Worker clippy configuration
#![allow(dead_code)]
#![allow(clippy::if_same_then_else)]

//! PlexMCP Background Worker
//!
//! Runs the gateway's scheduled maintenance jobs, separate from the API
//! server's request path so a slow sweep never competes with proxy traffic
//! for the same tokio runtime:
//! - Invariant check sweep (every 15 minutes)
//! - Spend cap monthly period reset (daily at 00:10 UTC)
//! - Retention hard-delete of organizations and users soft-deleted 30+ days
//!   ago (daily at 03:00 UTC)

use std::time::Duration;

use plexmcp_quota::{InvariantChecker, SpendCap};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)]
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("database pool created");
    Ok(pool)
}

/// Hard-deletes organizations and users whose `deleted_at` is more than 30
/// days old. Child rows are removed first, in dependency order, inside a
/// transaction per entity so a failure partway through never leaves an
/// organization half-deleted.
///
/// A user who authored a `custom_limit_history` row as `changed_by` is
/// skipped rather than hard-deleted: that column is a non-nullable
/// foreign key recording who granted a custom limit, and overwriting or
/// nulling out that provenance to force the delete would make the history
/// it's there to audit a lie. Those users stay soft-deleted until an
/// operator reassigns or clears the history rows that reference them.
async fn run_retention_sweep(pool: &sqlx::PgPool) {
    let org_ids: Vec<uuid::Uuid> = match sqlx::query_scalar(
        "select id from organizations where deleted_at is not null and deleted_at < now() - interval '30 days'",
    )
    .fetch_all(pool)
    .await
    {
        Ok(ids) => ids,
        Err(err) => {
            error!(error = %err, "failed to list organizations eligible for retention sweep");
            return;
        }
    };

    let mut orgs_deleted = 0u64;
    let mut orgs_failed = 0u64;
    for org_id in org_ids {
        let result: Result<(), sqlx::Error> = async {
            let mut tx = pool.begin().await?;
            sqlx::query("delete from custom_limit_history where org_id = $1")
                .bind(org_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("delete from support_tickets where org_id = $1")
                .bind(org_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("delete from mcp_descriptors where org_id = $1")
                .bind(org_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("delete from usage_counters where org_id = $1")
                .bind(org_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("delete from spend_caps where org_id = $1")
                .bind(org_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("delete from api_keys where org_id = $1")
                .bind(org_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("delete from memberships where org_id = $1")
                .bind(org_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("delete from organizations where id = $1")
                .bind(org_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => orgs_deleted += 1,
            Err(err) => {
                orgs_failed += 1;
                error!(org_id = %org_id, error = %err, "failed to hard-delete organization");
            }
        }
    }

    let user_ids: Vec<uuid::Uuid> = match sqlx::query_scalar(
        r#"
        select u.id from users u
        where u.deleted_at is not null
          and u.deleted_at < now() - interval '30 days'
          and not exists (select 1 from custom_limit_history h where h.changed_by = u.id)
        "#,
    )
    .fetch_all(pool)
    .await
    {
        Ok(ids) => ids,
        Err(err) => {
            error!(error = %err, "failed to list users eligible for retention sweep");
            return;
        }
    };

    let mut users_deleted = 0u64;
    let mut users_failed = 0u64;
    for user_id in user_ids {
        let result: Result<(), sqlx::Error> = async {
            let mut tx = pool.begin().await?;
            sqlx::query("delete from credentials where user_id = $1")
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("delete from second_factors where user_id = $1")
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("delete from backup_codes where user_id = $1")
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("delete from user_sessions where user_id = $1")
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("delete from memberships where user_id = $1")
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("delete from users where id = $1")
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => users_deleted += 1,
            Err(err) => {
                users_failed += 1;
                error!(user_id = %user_id, error = %err, "failed to hard-delete user");
            }
        }
    }

    info!(
        orgs_deleted,
        orgs_failed, users_deleted, users_failed, "retention sweep complete"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("starting plexmcp worker");

    let pool = create_db_pool().await?;
    let invariant_checker = InvariantChecker::new(pool.clone());
    let spend_cap = SpendCap::new(pool.clone());

    let scheduler = JobScheduler::new().await?;

    let checker_for_job = invariant_checker;
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let checker = checker_for_job.clone();
            Box::pin(async move {
                match checker.run_all_checks().await {
                    Ok(report) => {
                        if report.violations.is_empty() {
                            info!("invariant sweep clean");
                        } else {
                            warn!(
                                violations = report.violations.len(),
                                "invariant sweep found violations: {:?}", report.violations
                            );
                        }
                    }
                    Err(err) => error!(error = %err, "invariant sweep failed"),
                }
            })
        })?)
        .await?;
    info!("scheduled: invariant sweep (every 15 minutes)");

    let spend_cap_for_job = spend_cap;
    scheduler
        .add(Job::new_async("0 10 0 * * *", move |_uuid, _l| {
            let spend_cap = spend_cap_for_job.clone();
            Box::pin(async move {
                match spend_cap.reset_elapsed_periods().await {
                    Ok(reset) => info!(reset, "spend cap period reset complete"),
                    Err(err) => error!(error = %err, "spend cap period reset failed"),
                }
            })
        })?)
        .await?;
    info!("scheduled: spend cap period reset (daily at 00:10 UTC)");

    let retention_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let pool = retention_pool.clone();
            Box::pin(async move {
                run_retention_sweep(&pool).await;
            })
        })?)
        .await?;
    info!("scheduled: retention hard-delete sweep (daily at 03:00 UTC)");

    scheduler.start().await?;
    info!("worker started with 3 scheduled jobs");

    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
