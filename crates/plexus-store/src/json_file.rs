//! JSON file repository implementation

use crate::{MetadataRepository, PluginRecord, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Deserialize)]
struct JsonStoreData {
    plugins: Vec<PluginRecord>,
}

/// Repository persisted as one pretty-printed JSON document
///
/// The whole document is held in memory and rewritten after every mutation.
/// Suitable for the handful of records a plugin host keeps.
#[derive(Debug)]
pub struct JsonFileRepository {
    path: PathBuf,
    data: Mutex<JsonStoreData>,
}

impl JsonFileRepository {
    /// Open the document at `path`, starting empty if the file is missing
    ///
    /// Parent directories are created on first write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                JsonStoreData::default()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            JsonStoreData::default()
        };

        info!(
            path = %path.display(),
            records = data.plugins.len(),
            "Opened plugin metadata store"
        );

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist_locked(&self, data: &JsonStoreData) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, json)?;
        debug!(path = %self.path.display(), "Persisted plugin metadata");
        Ok(())
    }
}

#[async_trait]
impl MetadataRepository for JsonFileRepository {
    async fn upsert(&self, record: PluginRecord) -> Result<()> {
        let mut data = self.data.lock();
        match data.plugins.iter_mut().find(|p| p.id == record.id) {
            Some(existing) => *existing = record,
            None => {
                data.plugins.push(record);
                data.plugins.sort_by(|a, b| a.id.cmp(&b.id));
            }
        }
        self.persist_locked(&data)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<PluginRecord>> {
        Ok(self.data.lock().plugins.iter().find(|p| p.id == id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<PluginRecord>> {
        Ok(self.data.lock().plugins.clone())
    }

    fn backend_name(&self) -> &'static str {
        "json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(id: &str) -> PluginRecord {
        PluginRecord::new(id, format!("Plugin {id}"), "1.0.0", format!("/plugins/{id}.so"))
    }

    #[tokio::test]
    async fn test_upsert_adds_and_updates() {
        let dir = tempdir().unwrap();
        let repo = JsonFileRepository::open(dir.path().join("plugins.json")).unwrap();

        repo.upsert(record("b")).await.unwrap();
        repo.upsert(record("a")).await.unwrap();

        let mut updated = record("b");
        updated.set_enabled(true);
        repo.upsert(updated).await.unwrap();

        let all = repo.list_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "a");
        assert!(all[1].enabled);
        assert_eq!(repo.list_by_enabled(true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("plugins.json");

        {
            let repo = JsonFileRepository::open(&path).unwrap();
            let mut enabled = record("p1");
            enabled.set_enabled(true);
            repo.upsert(enabled).await.unwrap();
        }

        let reopened = JsonFileRepository::open(&path).unwrap();
        let found = reopened.find_by_id("p1").await.unwrap().unwrap();
        assert!(found.enabled);
        assert!(found.last_enabled_at.is_some());
        assert_eq!(found.module_path, PathBuf::from("/plugins/p1.so"));
    }

    #[tokio::test]
    async fn test_missing_and_empty_files_start_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plugins.json");

        let repo = JsonFileRepository::open(&path).unwrap();
        assert!(repo.list_all().await.unwrap().is_empty());
        assert!(!path.exists());

        fs::write(&path, "").unwrap();
        let repo = JsonFileRepository::open(&path).unwrap();
        assert!(repo.list_all().await.unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plugins.json");
        fs::write(&path, "{ not json").unwrap();

        let err = JsonFileRepository::open(&path).unwrap_err();
        assert!(matches!(err, crate::StoreError::Serialization(_)));
    }
}
