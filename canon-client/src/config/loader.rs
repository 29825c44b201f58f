//! Configuration loader

use std::path::Path;

use canon_utils::{config_file, CanonError, Result};

use super::ClientConfig;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from default location
    pub fn load() -> Result<ClientConfig> {
        let path = config_file();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            Ok(ClientConfig::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<ClientConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| CanonError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&content, path)
    }

    /// Parse configuration from string
    pub fn parse(content: &str, path: &Path) -> Result<ClientConfig> {
        toml::from_str(content).map_err(|e| CanonError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Validate configuration
    pub fn validate(config: &ClientConfig) -> Result<()> {
        if config.namespace.prefix.trim().is_empty() {
            return Err(CanonError::config("namespace.prefix must not be empty"));
        }

        let reconnect = &config.reconnect;
        if reconnect.base_delay_ms == 0 {
            return Err(CanonError::config("reconnect.base_delay_ms must be positive"));
        }
        if reconnect.max_delay_ms < reconnect.base_delay_ms {
            return Err(CanonError::config(
                "reconnect.max_delay_ms must be at least base_delay_ms",
            ));
        }
        if reconnect.max_attempts == 0 {
            return Err(CanonError::config("reconnect.max_attempts must be at least 1"));
        }

        if config.health.interval_secs < 5 {
            return Err(CanonError::config("health.interval_secs must be at least 5"));
        }

        if let Some(addr) = &config.connection.addr {
            if addr.trim().is_empty() {
                return Err(CanonError::config("connection.addr must not be empty"));
            }
        }

        Ok(())
    }

    /// Load from `path` if given, else the default location, and validate
    pub fn load_and_validate(path: Option<&Path>) -> Result<ClientConfig> {
        let config = match path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::load()?,
        };
        Self::validate(&config)?;
        Ok(config)
    }
}
