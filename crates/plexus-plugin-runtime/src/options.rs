//! Runtime options

use std::path::PathBuf;
use std::time::Duration;

/// Default plugin directory, relative to the working directory
pub const DEFAULT_PLUGIN_DIRECTORY: &str = "plugins";

/// Knobs shared by discovery and the loader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginOptions {
    /// Directory scanned for modules
    pub directory: PathBuf,

    /// Descend into subdirectories
    pub recursive: bool,

    /// File extensions treated as modules, without the leading dot
    pub extensions: Vec<String>,

    /// Enabled flag given to newly discovered plugins
    pub auto_enable_new_plugins: bool,

    /// Reject modules exporting more than one plugin type
    pub strict_selection: bool,

    /// Deadline for `initialize`
    pub init_timeout: Duration,

    /// Deadline for `shutdown`
    pub shutdown_timeout: Duration,
}

impl Default for PluginOptions {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(DEFAULT_PLUGIN_DIRECTORY),
            recursive: true,
            extensions: default_extensions(),
            auto_enable_new_plugins: false,
            strict_selection: false,
            init_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl PluginOptions {
    /// Options scanning `directory` with every other knob at its default
    pub fn with_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    /// Whether `path` carries one of the module extensions
    pub fn is_module_file(&self, path: &std::path::Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                self.extensions
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }
}

/// Shared library extensions of every supported platform
pub fn default_extensions() -> Vec<String> {
    ["so", "dylib", "dll"].iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_defaults() {
        let options = PluginOptions::default();
        assert_eq!(options.directory, PathBuf::from("plugins"));
        assert!(!options.auto_enable_new_plugins);
        assert_eq!(options.extensions, vec!["so", "dylib", "dll"]);
    }

    #[test]
    fn test_is_module_file() {
        let options = PluginOptions::default();
        assert!(options.is_module_file(Path::new("plugins/libsample.so")));
        assert!(options.is_module_file(Path::new("plugins/Sample.DLL")));
        assert!(!options.is_module_file(Path::new("plugins/readme.md")));
        assert!(!options.is_module_file(Path::new("plugins/noext")));
    }
}
