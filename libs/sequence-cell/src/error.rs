use thiserror::Error;

use shared_database::DatabaseError;

#[derive(Error, Debug)]
pub enum SequenceError {
    #[error("Sequence {key} cannot advance past {value}")]
    Exhausted { key: String, value: i64 },

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis pool error: {0}")]
    Pool(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Unexpected counter value for {key}: {detail}")]
    InvalidValue { key: String, detail: String },

    #[error("Sequence backend not configured: {0}")]
    NotConfigured(String),
}
