use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::RwLock;

/// Bridge tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Undelivered `Data` events per subscriber before shedding
    pub event_queue_capacity: usize,
    pub hotplug_poll_interval_ms: u64,
    /// Upper bound for one provider's enumeration
    pub enumeration_timeout_ms: u64,
    /// Default tracing filter when `RUST_LOG` is unset
    pub log_filter: String,
}

impl BridgeConfig {
    pub fn hotplug_poll_interval(&self) -> Duration {
        Duration::from_millis(self.hotplug_poll_interval_ms)
    }

    pub fn enumeration_timeout(&self) -> Duration {
        Duration::from_millis(self.enumeration_timeout_ms)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: 64,
            hotplug_poll_interval_ms: 1000,
            enumeration_timeout_ms: 5000,
            log_filter: "info".to_string(),
        }
    }
}

/// Persists [`BridgeConfig`] as JSON
pub struct ConfigStore {
    config_path: PathBuf,
    state: Arc<RwLock<BridgeConfig>>,
}

impl ConfigStore {
    /// Creates a store holding the defaults. Call `load()` to read the file.
    pub fn new(config_path: PathBuf) -> Self {
        Self {
            config_path,
            state: Arc::new(RwLock::new(BridgeConfig::default())),
        }
    }

    /// `~/.sdrbridge/config.json`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to resolve home directory")?;
        Ok(home.join(".sdrbridge").join("config.json"))
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub async fn ensure_config_file(&self) -> Result<()> {
        if !self.config_path.exists() {
            if let Some(parent) = self.config_path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }

            let json = serde_json::to_string_pretty(&BridgeConfig::default())?;
            fs::write(&self.config_path, json)
                .await
                .context("Failed to write default config")?;
        }

        Ok(())
    }

    pub async fn load(&self) -> Result<BridgeConfig> {
        self.ensure_config_file().await?;

        let content = fs::read_to_string(&self.config_path)
            .await
            .context("Failed to read config file")?;

        let config: BridgeConfig =
            serde_json::from_str(&content).context("Failed to parse config JSON")?;

        *self.state.write().await = config.clone();
        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        let config = self.state.read().await;
        let json = serde_json::to_string_pretty(&*config)?;

        // Write to temporary file first
        let temp_path = self.config_path.with_extension("tmp");
        fs::write(&temp_path, json)
            .await
            .context("Failed to write temporary config file")?;

        fs::rename(&temp_path, &self.config_path)
            .await
            .context("Failed to atomically update config file")?;

        Ok(())
    }

    pub async fn get(&self) -> BridgeConfig {
        self.state.read().await.clone()
    }

    /// Apply `f` to the config and persist the result
    pub async fn update(&self, f: impl FnOnce(&mut BridgeConfig)) -> Result<BridgeConfig> {
        let mut config = self.state.write().await;
        f(&mut *config);
        let updated = config.clone();
        drop(config); // Release lock before saving

        self.save().await?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_creates_default_file() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("nested").join("config.json"));

        let config = store.load().await.unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn test_update_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let store = ConfigStore::new(path.clone());
        store.load().await.unwrap();
        store
            .update(|c| {
                c.event_queue_capacity = 8;
                c.log_filter = "sdrbridge=debug".to_string();
            })
            .await
            .unwrap();

        let reopened = ConfigStore::new(path);
        let config = reopened.load().await.unwrap();
        assert_eq!(config.event_queue_capacity, 8);
        assert_eq!(config.log_filter, "sdrbridge=debug");
        assert!(!dir.path().join("config.tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_fields_take_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{"hotplug_poll_interval_ms": 250}"#)
            .await
            .unwrap();

        let config = ConfigStore::new(path).load().await.unwrap();
        assert_eq!(config.hotplug_poll_interval(), Duration::from_millis(250));
        assert_eq!(config.enumeration_timeout_ms, 5000);
    }
}
