//! Database error taxonomy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("invalid stage transition for {product_id}: {from} -> {to}")]
    InvalidStageTransition {
        product_id: String,
        from: String,
        to: String,
    },
}

pub type Result<T> = std::result::Result<T, DbError>;
