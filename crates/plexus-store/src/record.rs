//! Persisted plugin record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Durable metadata for one discovered plugin
///
/// `id` is the primary key and never changes once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRecord {
    /// Stable unique identifier
    pub id: String,

    /// Human readable name
    pub name: String,

    /// Free-form version string
    pub version: String,

    /// Location of the module file
    pub module_path: PathBuf,

    /// Whether the plugin is eligible to run
    pub enabled: bool,

    /// When the plugin was first recorded
    pub installed_at: DateTime<Utc>,

    /// When the plugin was last enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_enabled_at: Option<DateTime<Utc>>,
}

impl PluginRecord {
    /// Create a disabled record installed now
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        module_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            module_path: module_path.into(),
            enabled: false,
            installed_at: Utc::now(),
            last_enabled_at: None,
        }
    }

    /// Set the enabled flag at construction
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        if enabled {
            self.last_enabled_at = Some(self.installed_at);
        }
        self
    }

    /// Flip the enabled flag, stamping `last_enabled_at` when enabling
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if enabled {
            self.last_enabled_at = Some(Utc::now());
        }
    }
}
