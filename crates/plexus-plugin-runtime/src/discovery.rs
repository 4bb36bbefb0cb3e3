//! Module discovery and metadata extraction

use crate::error::{DiscoveryError, PluginRuntimeError, Result};
use crate::module::{instantiate, panic_message, ModuleError, ModuleResolver};
use crate::options::PluginOptions;
use plexus_plugin_api::PluginDescriptor;
use plexus_store::{MetadataRepository, PluginRecord};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Finds modules on disk and records them in the metadata repository
///
/// Every candidate is opened in a throwaway boundary that is released as
/// soon as its identity has been read. Discovery never removes records.
pub struct PluginDiscovery {
    options: PluginOptions,
    resolver: Arc<dyn ModuleResolver>,
    repository: Arc<dyn MetadataRepository>,
}

impl fmt::Debug for PluginDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDiscovery")
            .field("directory", &self.options.directory)
            .field("resolver", &self.resolver)
            .field("repository", &self.repository.backend_name())
            .finish()
    }
}

impl PluginDiscovery {
    /// Create a discovery service
    pub fn new(
        options: PluginOptions,
        resolver: Arc<dyn ModuleResolver>,
        repository: Arc<dyn MetadataRepository>,
    ) -> Self {
        Self {
            options,
            resolver,
            repository,
        }
    }

    /// Options in effect
    pub fn options(&self) -> &PluginOptions {
        &self.options
    }

    /// Scan the plugin directory and reconcile every module found
    ///
    /// Returns the full record set of the repository, including records
    /// whose module is no longer on disk.
    pub async fn discover(&self, cancel: &CancellationToken) -> Result<Vec<PluginRecord>> {
        let directory = self.options.directory.clone();
        tokio::fs::create_dir_all(&directory).await?;

        let candidates = self.scan_candidates(&directory);
        info!(
            directory = %directory.display(),
            candidates = candidates.len(),
            "Scanning for plugins"
        );

        let mut found: Vec<(PluginDescriptor, PathBuf)> = Vec::new();
        let mut seen: HashMap<String, usize> = HashMap::new();

        for path in candidates {
            if cancel.is_cancelled() {
                info!("Plugin discovery cancelled");
                return Err(PluginRuntimeError::Cancelled);
            }

            match self.inspect(&path).await {
                Ok(descriptor) => {
                    debug!(
                        plugin = %descriptor.id,
                        path = %path.display(),
                        "Found plugin"
                    );
                    match seen.get(&descriptor.id) {
                        Some(&index) => {
                            warn!(
                                plugin = %descriptor.id,
                                first = %found[index].1.display(),
                                second = %path.display(),
                                "Plugin id exported by several modules, keeping the last"
                            );
                            found[index] = (descriptor, path);
                        }
                        None => {
                            seen.insert(descriptor.id.clone(), found.len());
                            found.push((descriptor, path));
                        }
                    }
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Skipping module");
                }
            }
        }

        for (descriptor, path) in found {
            self.reconcile(descriptor, path).await?;
        }

        Ok(self.repository.list_all().await?)
    }

    /// Inspect one explicit path and record it
    pub async fn register_from_path(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<PluginRecord> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(DiscoveryError::ModuleNotFound(path.to_path_buf()).into());
        }
        if cancel.is_cancelled() {
            return Err(PluginRuntimeError::Cancelled);
        }

        let descriptor = self.inspect(path).await?;
        let record = self.reconcile(descriptor, path.to_path_buf()).await?;
        info!(plugin = %record.id, path = %path.display(), "Registered plugin");
        Ok(record)
    }

    /// Read a module's identity without keeping it resident
    pub async fn inspect(&self, path: &Path) -> std::result::Result<PluginDescriptor, DiscoveryError> {
        let boundary = self.resolver.open(path).await.map_err(|e| match e {
            ModuleError::NotFound(missing) => DiscoveryError::ModuleNotFound(missing),
            other => DiscoveryError::not_a_plugin(path, other),
        })?;

        let descriptor = {
            let factory = boundary
                .select(self.options.strict_selection)
                .map_err(|e| DiscoveryError::not_a_plugin(path, e))?;
            let instance = instantiate(factory).map_err(|e| DiscoveryError::not_a_plugin(path, e))?;
            catch_unwind(AssertUnwindSafe(|| instance.descriptor())).map_err(|payload| {
                DiscoveryError::not_a_plugin(
                    path,
                    format!("metadata accessor panicked: {}", panic_message(payload.as_ref())),
                )
            })?
        };

        drop(boundary);
        Ok(descriptor)
    }

    fn scan_candidates(&self, directory: &Path) -> Vec<PathBuf> {
        let walker = WalkDir::new(directory).follow_links(true);
        let walker = if self.options.recursive {
            walker
        } else {
            walker.max_depth(1)
        };

        let mut candidates: Vec<PathBuf> = walker
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "Failed to read plugin directory entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| self.options.is_module_file(path))
            .collect();
        candidates.sort();
        candidates
    }

    async fn reconcile(&self, descriptor: PluginDescriptor, path: PathBuf) -> Result<PluginRecord> {
        let record = match self.repository.find_by_id(&descriptor.id).await? {
            Some(mut existing) => {
                existing.name = descriptor.name;
                existing.version = descriptor.version;
                existing.module_path = path;
                existing
            }
            None => {
                info!(
                    plugin = %descriptor.id,
                    enabled = self.options.auto_enable_new_plugins,
                    "Recording new plugin"
                );
                PluginRecord::new(descriptor.id, descriptor.name, descriptor.version, path)
                    .enabled(self.options.auto_enable_new_plugins)
            }
        };

        self.repository.upsert(record.clone()).await?;
        Ok(record)
    }
}
