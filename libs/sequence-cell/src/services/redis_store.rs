use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::AsyncCommands;
use tracing::{debug, info};

use super::SequenceStore;
use crate::SequenceError;

const DEFAULT_NAMESPACE: &str = "sequence";

/// Counters kept as plain Redis integers; `INCR` is the atomic primitive.
pub struct RedisSequenceStore {
    pool: Pool,
    namespace: String,
}

impl RedisSequenceStore {
    pub async fn new(redis_url: &str, namespace: Option<String>) -> Result<Self, SequenceError> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| SequenceError::Pool(format!("Pool creation error: {}", e)))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| SequenceError::Pool(format!("Connection error: {}", e)))?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Redis sequence store initialized");

        Ok(Self {
            pool,
            namespace: namespace.unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
        })
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    async fn get_connection(&self) -> Result<Connection, SequenceError> {
        self.pool
            .get()
            .await
            .map_err(|e| SequenceError::Pool(e.to_string()))
    }
}

#[async_trait]
impl SequenceStore for RedisSequenceStore {
    async fn next_value(&self, key: &str) -> Result<i64, SequenceError> {
        let mut conn = self.get_connection().await?;
        let value: i64 = conn.incr(self.redis_key(key), 1).await?;
        debug!("Sequence {} advanced to {}", key, value);
        Ok(value)
    }

    async fn resync(&self, key: &str, value: i64) -> Result<(), SequenceError> {
        let mut conn = self.get_connection().await?;
        let _: () = conn.set(self.redis_key(key), value).await?;
        debug!("Sequence {} resynced to {}", key, value);
        Ok(())
    }

    async fn current(&self, key: &str) -> Result<Option<i64>, SequenceError> {
        let mut conn = self.get_connection().await?;
        let value: Option<i64> = conn.get(self.redis_key(key)).await?;
        Ok(value)
    }
}
