//! In-memory repository implementation

use crate::{MetadataRepository, PluginRecord, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

/// In-memory metadata repository
///
/// Records live as long as the process. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    records: Arc<DashMap<String, PluginRecord>>,
}

impl InMemoryRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a repository seeded with `records`
    pub fn with_records(records: impl IntoIterator<Item = PluginRecord>) -> Self {
        let repo = Self::new();
        for record in records {
            repo.records.insert(record.id.clone(), record);
        }
        repo
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no record is stored
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl MetadataRepository for InMemoryRepository {
    async fn upsert(&self, record: PluginRecord) -> Result<()> {
        trace!(plugin = %record.id, "Upserting plugin record");
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<PluginRecord>> {
        Ok(self.records.get(id).map(|entry| entry.value().clone()))
    }

    async fn list_all(&self) -> Result<Vec<PluginRecord>> {
        let mut records: Vec<_> = self.records.iter().map(|e| e.value().clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn list_by_enabled(&self, enabled: bool) -> Result<Vec<PluginRecord>> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .filter(|e| e.value().enabled == enabled)
            .map(|e| e.value().clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
