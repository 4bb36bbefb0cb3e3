//! Metadata repository trait definition

use crate::{PluginRecord, Result};
use async_trait::async_trait;

/// Durable store for plugin records
///
/// Implementations must be safe for concurrent callers. Listings are ordered
/// by `id` so callers see a stable order across backends.
#[async_trait]
pub trait MetadataRepository: Send + Sync + 'static {
    /// Insert or replace the record with the same `id`
    async fn upsert(&self, record: PluginRecord) -> Result<()>;

    /// Look up one record
    async fn find_by_id(&self, id: &str) -> Result<Option<PluginRecord>>;

    /// Every stored record
    async fn list_all(&self) -> Result<Vec<PluginRecord>>;

    /// Records whose `enabled` flag equals `enabled`
    async fn list_by_enabled(&self, enabled: bool) -> Result<Vec<PluginRecord>> {
        let mut records = self.list_all().await?;
        records.retain(|r| r.enabled == enabled);
        Ok(records)
    }

    /// Backend name for logs
    fn backend_name(&self) -> &'static str;
}
