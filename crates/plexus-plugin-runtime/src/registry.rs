//! Plugin registry: enable/disable state over the metadata repository

use crate::error::Result;
use plexus_store::{MetadataRepository, PluginRecord};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Read/write facade over the metadata repository
///
/// Holds no state of its own; every call goes to the repository, so the
/// registry is always the authority on which plugins may run.
#[derive(Clone)]
pub struct PluginRegistry {
    repository: Arc<dyn MetadataRepository>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("backend", &self.repository.backend_name())
            .finish()
    }
}

impl PluginRegistry {
    /// Create a registry over `repository`
    pub fn new(repository: Arc<dyn MetadataRepository>) -> Self {
        Self { repository }
    }

    /// The underlying repository
    pub fn repository(&self) -> &Arc<dyn MetadataRepository> {
        &self.repository
    }

    /// Every known plugin
    pub async fn list_all(&self) -> Result<Vec<PluginRecord>> {
        Ok(self.repository.list_all().await?)
    }

    /// Plugins eligible to run
    pub async fn list_enabled(&self) -> Result<Vec<PluginRecord>> {
        Ok(self.repository.list_by_enabled(true).await?)
    }

    /// Look up one plugin
    pub async fn get_by_id(&self, id: &str) -> Result<Option<PluginRecord>> {
        debug!(plugin = %id, "Looking up plugin record");
        Ok(self.repository.find_by_id(id).await?)
    }

    /// Persist a new enabled flag
    ///
    /// Returns `false` when no record has this id. Enabling refreshes
    /// `last_enabled_at`; repeating the current state is allowed.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let Some(mut record) = self.repository.find_by_id(id).await? else {
            debug!(plugin = %id, "No record to update");
            return Ok(false);
        };

        record.set_enabled(enabled);
        self.repository.upsert(record).await?;
        info!(plugin = %id, enabled, "Plugin enabled state changed");
        Ok(true)
    }
}
