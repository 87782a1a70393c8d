//! Configuration for the virtshift CLI.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use virtshift_migrate::MigrationConfig;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Inventory backend configuration
    pub inventory: InventoryConfig,
    /// Remote shell configuration
    pub ssh: SshConfig,
    /// VM storage configuration
    pub storage: StorageConfig,
    /// Migration tunables
    pub migration: MigrationSettings,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    pub fn migration_config(&self) -> MigrationConfig {
        MigrationConfig {
            sync_timeout: self.migration.sync_timeout_secs.map(Duration::from_secs),
            sync_poll_interval: Duration::from_millis(self.migration.sync_poll_interval_millis),
            shutdown_timeout: Duration::from_secs(self.migration.shutdown_timeout_secs),
        }
    }
}

/// Inventory backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    /// Path to the JSON inventory file
    pub path: String,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            path: "/var/lib/virtshift/inventory.json".to_string(),
        }
    }
}

/// Remote shell configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// User the channels authenticate as
    pub user: String,
    /// Extra raw ssh arguments (jump host, port, identity file)
    pub options: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            options: Vec::new(),
        }
    }
}

/// VM storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Volume group holding VM volumes on every hypervisor
    pub volume_group: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            volume_group: "xen-data".to_string(),
        }
    }
}

/// Migration tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    /// Ceiling for the disk synchronization in seconds; unset waits
    /// indefinitely
    pub sync_timeout_secs: Option<u64>,
    /// Poll interval of the sync progress loop in milliseconds
    pub sync_poll_interval_millis: u64,
    /// Graceful shutdown timeout in seconds for offline migrations
    pub shutdown_timeout_secs: u64,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            sync_timeout_secs: None,
            sync_poll_interval_millis: 1000,
            shutdown_timeout_secs: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = Config::default();
        assert_eq!(config.ssh.user, "root");
        assert_eq!(config.storage.volume_group, "xen-data");

        let migration = config.migration_config();
        assert_eq!(migration.sync_timeout, None);
        assert_eq!(migration.sync_poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn partial_yaml_overrides_defaults() {
        let config: Config = serde_yaml::from_str(
            "ssh:\n  user: vmadmin\nmigration:\n  sync_timeout_secs: 7200\n",
        )
        .unwrap();
        assert_eq!(config.ssh.user, "vmadmin");
        assert_eq!(
            config.migration_config().sync_timeout,
            Some(Duration::from_secs(7200))
        );
        assert_eq!(config.storage.volume_group, "xen-data");
    }
}
