//! Configuration types

use plexus_plugin_runtime::PluginOptions;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Host timeouts
    #[serde(default)]
    pub host: HostConfig,

    /// Plugin directory and discovery policy
    #[serde(default)]
    pub plugins: PluginsConfig,

    /// Metadata storage backend
    #[serde(default)]
    pub storage: StorageConfig,

    /// Observability
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Loader options derived from the host and plugin sections
    pub fn plugin_options(&self) -> PluginOptions {
        PluginOptions {
            directory: self.plugins.directory.clone(),
            recursive: self.plugins.recursive,
            extensions: self.plugins.extensions.clone(),
            auto_enable_new_plugins: self.plugins.auto_enable_new_plugins,
            strict_selection: self.plugins.strict_selection,
            init_timeout: self.host.init_timeout,
            shutdown_timeout: self.host.shutdown_timeout,
        }
    }
}

/// Host configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    /// Upper bound on a single plugin's initialize
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub init_timeout: Duration,

    /// Upper bound on a single plugin's shutdown
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            init_timeout: default_timeout(),
            shutdown_timeout: default_timeout(),
        }
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Plugin discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginsConfig {
    /// Directory scanned for plugin modules
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// Descend into subdirectories
    #[serde(default = "default_true")]
    pub recursive: bool,

    /// Enable plugins the first time they are discovered
    #[serde(default)]
    pub auto_enable_new_plugins: bool,

    /// Reject modules exporting more than one plugin type
    #[serde(default)]
    pub strict_selection: bool,

    /// Module file extensions, without the dot
    #[serde(default = "plexus_plugin_runtime::options::default_extensions")]
    pub extensions: Vec<String>,

    /// Register modules dropped into the directory while running
    #[serde(default)]
    pub watch: bool,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            recursive: true,
            auto_enable_new_plugins: false,
            strict_selection: false,
            extensions: plexus_plugin_runtime::options::default_extensions(),
            watch: false,
        }
    }
}

fn default_directory() -> PathBuf {
    PathBuf::from(plexus_plugin_runtime::options::DEFAULT_PLUGIN_DIRECTORY)
}

fn default_true() -> bool {
    true
}

/// Metadata storage backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Records live only as long as the process
    Memory,
    /// Records persisted to a JSON file
    Json {
        /// File path
        #[serde(default = "default_store_path")]
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Json {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("plexus-plugins.json")
}

/// Observability configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObservabilityConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_level")]
    pub level: String,

    /// Log format (json, text)
    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "text".to_string()
}
