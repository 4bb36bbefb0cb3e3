//! Configuration validation

use crate::error::{ConfigError, Result};
use crate::types::{Config, StorageConfig};

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: &[&str] = &["text", "json"];

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_host(config)?;
    validate_plugins(config)?;
    validate_storage(config)?;
    validate_observability(config)?;
    Ok(())
}

fn validate_host(config: &Config) -> Result<()> {
    if config.host.init_timeout.is_zero() {
        return Err(ConfigError::invalid("host.init_timeout must be > 0"));
    }
    if config.host.shutdown_timeout.is_zero() {
        return Err(ConfigError::invalid("host.shutdown_timeout must be > 0"));
    }

    if config.host.init_timeout.as_secs() > 300 {
        tracing::warn!("init_timeout is very high (>5 minutes)");
    }

    Ok(())
}

fn validate_plugins(config: &Config) -> Result<()> {
    let plugins = &config.plugins;

    if plugins.directory.as_os_str().is_empty() {
        return Err(ConfigError::invalid("plugins.directory cannot be empty"));
    }

    if plugins.extensions.is_empty() {
        return Err(ConfigError::invalid("plugins.extensions cannot be empty"));
    }

    for ext in &plugins.extensions {
        if ext.is_empty() {
            return Err(ConfigError::invalid("plugin extension cannot be empty"));
        }
        if ext.starts_with('.') {
            return Err(ConfigError::invalid(format!(
                "plugin extension '{ext}' must not start with '.'"
            )));
        }
    }

    Ok(())
}

fn validate_storage(config: &Config) -> Result<()> {
    if let StorageConfig::Json { path } = &config.storage {
        if path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("storage.path cannot be empty"));
        }
    }
    Ok(())
}

fn validate_observability(config: &Config) -> Result<()> {
    let logging = &config.observability.logging;

    if !LOG_LEVELS.contains(&logging.level.to_ascii_lowercase().as_str()) {
        return Err(ConfigError::invalid(format!(
            "Invalid log level: {} (expected one of {})",
            logging.level,
            LOG_LEVELS.join(", ")
        )));
    }

    if !LOG_FORMATS.contains(&logging.format.as_str()) {
        return Err(ConfigError::invalid(format!(
            "Invalid log format: {} (must be text or json)",
            logging.format
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_timeout() {
        let mut config = Config::default();
        config.host.shutdown_timeout = Duration::ZERO;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_extension_rules() {
        let mut config = Config::default();
        config.plugins.extensions = vec![".so".to_string()];
        assert!(validate_config(&config).is_err());

        config.plugins.extensions = vec![String::new()];
        assert!(validate_config(&config).is_err());

        config.plugins.extensions = vec!["so".to_string(), "mod".to_string()];
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_empty_directory() {
        let mut config = Config::default();
        config.plugins.directory = PathBuf::new();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_storage_path() {
        let mut config = Config::default();
        config.storage = StorageConfig::Json {
            path: PathBuf::new(),
        };
        assert!(validate_config(&config).is_err());

        config.storage = StorageConfig::Memory;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_logging() {
        let mut config = Config::default();
        config.observability.logging.level = "WARN".to_string();
        assert!(validate_config(&config).is_ok());

        config.observability.logging.level = "loud".to_string();
        assert!(validate_config(&config).is_err());

        config.observability.logging.level = "info".to_string();
        config.observability.logging.format = "xml".to_string();
        assert!(validate_config(&config).is_err());
    }
}
