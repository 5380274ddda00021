use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use shared_database::SupabaseClient;

use super::SequenceStore;
use crate::SequenceError;

/// Counters in the `sequence_counters` table, advanced by the
/// `next_sequence_value` function (`INSERT .. ON CONFLICT DO UPDATE .. RETURNING`).
pub struct SupabaseSequenceStore {
    supabase: Arc<SupabaseClient>,
}

#[derive(Debug, Deserialize)]
struct CounterRow {
    value: i64,
}

impl SupabaseSequenceStore {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }
}

#[async_trait]
impl SequenceStore for SupabaseSequenceStore {
    async fn next_value(&self, key: &str) -> Result<i64, SequenceError> {
        let value: Value = self
            .supabase
            .rpc("next_sequence_value", json!({ "p_key": key }), None)
            .await?;

        let next = value.as_i64().ok_or_else(|| SequenceError::InvalidValue {
            key: key.to_string(),
            detail: value.to_string(),
        })?;
        debug!("Sequence {} advanced to {}", key, next);
        Ok(next)
    }

    async fn resync(&self, key: &str, value: i64) -> Result<(), SequenceError> {
        let _: Value = self
            .supabase
            .rpc(
                "resync_sequence_value",
                json!({ "p_key": key, "p_value": value }),
                None,
            )
            .await?;
        debug!("Sequence {} resynced to {}", key, value);
        Ok(())
    }

    async fn current(&self, key: &str) -> Result<Option<i64>, SequenceError> {
        let path = format!(
            "/rest/v1/sequence_counters?key=eq.{}&select=value",
            urlencoding::encode(key)
        );
        let rows: Vec<CounterRow> = self
            .supabase
            .request(Method::GET, &path, None, None)
            .await?;
        Ok(rows.first().map(|row| row.value))
    }
}
