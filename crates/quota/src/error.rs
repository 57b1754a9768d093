use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type QuotaResult<T> = Result<T, QuotaError>;
