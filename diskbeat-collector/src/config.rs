use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

use diskbeat_protocol::DEFAULT_MAX_FRAME_LEN;

pub const CONFIG_PATH_ENV: &str = "DISKBEAT_COLLECTOR_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub listen: ListenConf,
    pub heartbeat: HeartbeatConf,
    pub store: StoreConf,
    /// How long the collector stays up with no active probe
    pub idle_grace_secs: u64,
    pub max_frame_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConf {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConf {
    pub enabled: bool,
    pub group: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConf {
    pub path: PathBuf,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            listen: ListenConf::default(),
            heartbeat: HeartbeatConf::default(),
            store: StoreConf::default(),
            idle_grace_secs: 30,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl Default for ListenConf {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9999,
        }
    }
}

impl Default for HeartbeatConf {
    fn default() -> Self {
        Self {
            enabled: true,
            group: Ipv4Addr::new(239, 255, 42, 99),
            port: 5007,
        }
    }
}

impl Default for StoreConf {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/probes"),
        }
    }
}

impl CollectorConfig {
    pub async fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "collector.yaml".into());
        Self::load_from(Path::new(&path)).await
    }

    pub async fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("loaded collector config from {}", path.display());
        Ok(config)
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.idle_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_partial_yaml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector.yaml");
        std::fs::write(&path, "listen:\n  port: 7000\nheartbeat:\n  enabled: false\n").unwrap();

        let config = CollectorConfig::load_from(&path).await.unwrap();
        assert_eq!(config.listen.port, 7000);
        assert_eq!(config.listen.host, "0.0.0.0");
        assert!(!config.heartbeat.enabled);
        assert_eq!(config.heartbeat.port, 5007);
        assert_eq!(config.idle_grace(), Duration::from_secs(30));
        assert_eq!(config.max_frame_len, DEFAULT_MAX_FRAME_LEN);
    }

    #[tokio::test]
    async fn test_missing_and_broken_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = CollectorConfig::load_from(&dir.path().join("absent.yaml")).await.unwrap();
        assert_eq!(config.listen.port, 9999);

        let broken = dir.path().join("broken.yaml");
        std::fs::write(&broken, "listen: [1, 2").unwrap();
        assert!(matches!(
            CollectorConfig::load_from(&broken).await,
            Err(ConfigError::Parse { .. })
        ));
    }
}
