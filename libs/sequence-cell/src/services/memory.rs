use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::SequenceStore;
use crate::SequenceError;

/// Process-local counters; the mutex makes each increment one critical section.
#[derive(Default)]
pub struct InMemorySequenceStore {
    counters: Mutex<HashMap<String, i64>>,
}

impl InMemorySequenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SequenceStore for InMemorySequenceStore {
    async fn next_value(&self, key: &str) -> Result<i64, SequenceError> {
        let mut counters = self.counters.lock().await;
        let counter = counters.entry(key.to_string()).or_insert(0);
        let next = counter.checked_add(1).ok_or_else(|| SequenceError::Exhausted {
            key: key.to_string(),
            value: *counter,
        })?;
        *counter = next;
        debug!("Sequence {} advanced to {}", key, next);
        Ok(next)
    }

    async fn resync(&self, key: &str, value: i64) -> Result<(), SequenceError> {
        let mut counters = self.counters.lock().await;
        counters.insert(key.to_string(), value);
        debug!("Sequence {} resynced to {}", key, value);
        Ok(())
    }

    async fn current(&self, key: &str) -> Result<Option<i64>, SequenceError> {
        Ok(self.counters.lock().await.get(key).copied())
    }
}
