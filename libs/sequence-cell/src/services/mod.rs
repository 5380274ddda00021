pub mod memory;
pub mod redis_store;
pub mod supabase;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use shared_config::{AppConfig, SequenceBackend};
use shared_database::SupabaseClient;

use crate::SequenceError;

pub use self::memory::InMemorySequenceStore;
pub use self::redis_store::RedisSequenceStore;
pub use self::supabase::SupabaseSequenceStore;

/// Named monotonic counters.
///
/// `next_value` must be a single atomic read-modify-write in the backing store:
/// concurrent callers on the same key never observe the same value. A missing
/// counter starts at 0, so the first value handed out is 1.
#[async_trait]
pub trait SequenceStore: Send + Sync {
    async fn next_value(&self, key: &str) -> Result<i64, SequenceError>;

    /// Overwrites the counter. Not atomic with respect to `next_value`; callers
    /// must pause traffic on `key` while resyncing.
    async fn resync(&self, key: &str, value: i64) -> Result<(), SequenceError>;

    async fn current(&self, key: &str) -> Result<Option<i64>, SequenceError>;
}

/// Builds the allocator selected by `SEQUENCE_BACKEND`.
pub async fn build_sequence_store(
    config: &AppConfig,
) -> Result<Arc<dyn SequenceStore>, SequenceError> {
    let store: Arc<dyn SequenceStore> = match config.sequence_backend {
        SequenceBackend::Memory => Arc::new(InMemorySequenceStore::new()),
        SequenceBackend::Redis => {
            let url = config.redis_url.clone().ok_or_else(|| {
                SequenceError::NotConfigured("REDIS_URL is required for the redis backend".to_string())
            })?;
            Arc::new(RedisSequenceStore::new(&url, None).await?)
        }
        SequenceBackend::Supabase => {
            Arc::new(SupabaseSequenceStore::new(Arc::new(SupabaseClient::new(config))))
        }
    };

    info!("Sequence allocator ready ({:?} backend)", config.sequence_backend);
    Ok(store)
}
