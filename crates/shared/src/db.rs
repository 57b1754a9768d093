//! Pool construction.
//!
//! Two distinct pools are kept deliberately separate: the request-serving
//! pool is tuned for many short-lived connections behind a transaction
//! pooler, while the migration pool bypasses any pooler and uses a longer
//! statement timeout so `sqlx::migrate!` can run DDL that a pooler would
//! otherwise kill mid-statement. Migrations are applied once at deploy time
//! by the worker binary, never on API boot.

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid database url: {0}")]
    InvalidUrl(#[from] sqlx::Error),
}

/// Pool for regular request traffic: short acquire timeout, bounded size.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, PoolError> {
    let opts = PgConnectOptions::from_str(database_url)?;
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(300))
        .connect_with(opts)
        .await?;
    Ok(pool)
}

/// Pool used only for running migrations: single connection, no pooler,
/// generous statement timeout for long-running DDL.
pub async fn create_migration_pool(database_url: &str) -> Result<PgPool, PoolError> {
    let opts = PgConnectOptions::from_str(database_url)?
        .options([("statement_timeout", "300000")]);
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(opts)
        .await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_url_is_rejected() {
        let err = PgConnectOptions::from_str("not-a-url");
        assert!(err.is_err());
    }
}
