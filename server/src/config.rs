//! Configuration management for the analysis orchestration server
//!
//! This module handles loading and validation of the service configuration
//! from a `server.toml` file, plus the command-line overrides applied on top
//! of it at startup.

use anyhow::{Context, Result};
use shared::config::ServiceConfig;
use std::path::PathBuf;
use tracing::info;

/// The expected name of the configuration file.
const SERVER_CONFIG_FILE: &str = "server.toml";

/// Manages the server's configuration. The configuration is a snapshot:
/// loaded and validated once at startup, then treated as immutable.
pub struct ConfigManager {
    /// The full path to the configuration file, when one was given.
    pub config_path: Option<PathBuf>,
    /// The loaded and validated service configuration.
    pub service_config: ServiceConfig,
}

impl ConfigManager {
    /// Creates a new `ConfigManager` and immediately loads the
    /// configuration. Without a path, every option takes its default, which
    /// is a valid development setup.
    pub fn new(config_path: Option<PathBuf>) -> Result<Self> {
        let Some(config_path) = config_path else {
            info!("No configuration file given, using defaults");
            return Ok(Self {
                config_path: None,
                service_config: ServiceConfig::default(),
            });
        };

        // Accept either a directory containing server.toml or the file itself.
        let config_path = if config_path.is_dir() {
            config_path.join(SERVER_CONFIG_FILE)
        } else {
            config_path
        };

        if !config_path.exists() {
            return Err(anyhow::anyhow!(
                "Configuration file does not exist: {}",
                config_path.display()
            ));
        }

        info!("Loading configuration from {}", config_path.display());
        let service_config = ServiceConfig::load_from_file(&config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?;

        Ok(Self {
            config_path: Some(config_path),
            service_config,
        })
    }

    /// Apply command-line overrides on top of the loaded file, then
    /// re-validate the result.
    pub fn apply_overrides(
        &mut self,
        listen_address: Option<String>,
        data_dir: Option<String>,
        node_id: Option<String>,
        max_concurrent_tasks: Option<usize>,
    ) -> Result<()> {
        if let Some(listen_address) = listen_address {
            self.service_config.listen_address = listen_address;
        }
        if let Some(data_dir) = data_dir {
            self.service_config.data_dir = data_dir;
        }
        if let Some(node_id) = node_id {
            self.service_config.node_id = Some(node_id);
        }
        if let Some(max_concurrent_tasks) = max_concurrent_tasks {
            self.service_config.max_concurrent_tasks = max_concurrent_tasks;
        }

        self.service_config
            .validate()
            .context("Configuration invalid after command-line overrides")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let manager = ConfigManager::new(None).unwrap();
        assert_eq!(manager.service_config, ServiceConfig::default());
    }

    #[test]
    fn test_loads_file_from_directory() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(SERVER_CONFIG_FILE);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "listen_address = \"0.0.0.0:9100\"").unwrap();

        let manager = ConfigManager::new(Some(temp_dir.path().to_path_buf())).unwrap();
        assert_eq!(manager.service_config.listen_address, "0.0.0.0:9100");
    }

    #[test]
    fn test_missing_file_rejected() {
        assert!(ConfigManager::new(Some(PathBuf::from("/nonexistent/server.toml"))).is_err());
    }

    #[test]
    fn test_overrides_revalidate() {
        let mut manager = ConfigManager::new(None).unwrap();
        manager
            .apply_overrides(Some("0.0.0.0:9200".to_string()), None, None, Some(4))
            .unwrap();
        assert_eq!(manager.service_config.max_concurrent_tasks, 4);

        // An override that breaks validation is rejected.
        assert!(manager
            .apply_overrides(None, None, None, Some(0))
            .is_err());
    }

    #[test]
    fn test_invalid_file_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(SERVER_CONFIG_FILE);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "max_concurrent_tasks = 0").unwrap();

        assert!(ConfigManager::new(Some(path)).is_err());
    }
}
