use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(any(feature = "postgres", feature = "sqlite"))]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid row: {0}")]
    InvalidRow(String),

    #[error("{field} value {value} does not fit the column")]
    OutOfRange { field: &'static str, value: i64 },

    #[error("no message partition for tenant {0}")]
    PartitionNotFound(uuid::Uuid),
}

impl StoreError {
    pub fn invalid_row(msg: impl Into<String>) -> Self {
        Self::InvalidRow(msg.into())
    }
}
