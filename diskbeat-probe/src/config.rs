//! Probe configuration
//!
//! Loaded from YAML (path in `DISKBEAT_PROBE_CONFIG`, default `probe.yaml`):
//! - collector endpoint
//! - heartbeat multicast group and send interval
//! - load generator sizing, mode and working directory
//! - run duration and resource sampling period

use diskbeat_protocol::MAX_IDENTITY_LEN;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

pub const CONFIG_PATH_ENV: &str = "DISKBEAT_PROBE_CONFIG";
pub const PROBE_ID_ENV: &str = "DISKBEAT_PROBE_ID";

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
    #[error("chunk_size must be greater than zero")]
    ZeroChunk,
    #[error(
        "chunk size {chunk_size} is too large for max file size {file_size}: \
         file_size / chunk_size must be at least 2"
    )]
    ChunkRatio { chunk_size: u64, file_size: u64 },
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("probe identity is empty")]
    EmptyIdentity,
    #[error(
        "probe identity {0:?} must be one path segment of printable characters, at most {max} bytes",
        max = MAX_IDENTITY_LEN
    )]
    UnsafeIdentity(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Generated when absent
    pub probe_id: Option<String>,
    pub collector: CollectorConf,
    pub heartbeat: HeartbeatConf,
    pub load: LoadConf,
    pub run_time_secs: u64,
    pub resource_interval_secs: u64,
    /// How long the reporting loop keeps draining samples after shutdown
    pub drain_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConf {
    pub host: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConf {
    pub group: Ipv4Addr,
    pub port: u16,
    pub interval_secs: u64,
    pub multicast_loop: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Write through a file handle from inside the probe
    FileIo,
    /// Shell out to `dd if=/dev/zero`
    Dd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConf {
    pub mode: LoadMode,
    pub chunk_size: u64,
    pub file_size: u64,
    pub work_dir: PathBuf,
    pub pause_ms: u64,
    pub cleanup_grace_secs: u64,
    pub iteration_timeout_secs: u64,
    pub max_consecutive_failures: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            probe_id: None,
            collector: CollectorConf::default(),
            heartbeat: HeartbeatConf::default(),
            load: LoadConf::default(),
            run_time_secs: 30,
            resource_interval_secs: 10,
            drain_timeout_ms: 1000,
        }
    }
}

impl Default for CollectorConf {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9999,
            connect_timeout_secs: 5,
        }
    }
}

impl Default for HeartbeatConf {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 255, 42, 99),
            port: 5007,
            interval_secs: 5,
            multicast_loop: false,
        }
    }
}

impl Default for LoadConf {
    fn default() -> Self {
        Self {
            mode: LoadMode::FileIo,
            chunk_size: 10_000_000,
            file_size: 20_000_000,
            work_dir: PathBuf::from("."),
            pause_ms: 500,
            cleanup_grace_secs: 5,
            iteration_timeout_secs: 60,
            max_consecutive_failures: 3,
        }
    }
}

impl CollectorConf {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl LoadConf {
    /// Number of chunks written per file
    pub fn block_count(&self) -> u64 {
        if self.chunk_size == 0 {
            0
        } else {
            self.file_size / self.chunk_size
        }
    }

    /// Directory holding the generated files of one probe
    pub fn chunk_dir(&self, probe_id: &str) -> PathBuf {
        self.work_dir.join(probe_id).join("chunkfiles")
    }

    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_secs(self.cleanup_grace_secs)
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }
}

impl ProbeConfig {
    /// Reads the file named by `DISKBEAT_PROBE_CONFIG`, then applies env overrides
    pub async fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "probe.yaml".into());
        let mut config = Self::load_from(Path::new(&path)).await?;
        if let Ok(id) = std::env::var(PROBE_ID_ENV) {
            config.probe_id = Some(id);
        }
        Ok(config)
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
        info!("loaded probe config from {}", path.display());
        Ok(config)
    }

    /// Returns the configured identity, generating one on first use
    pub fn resolve_identity(&mut self) -> String {
        match &self.probe_id {
            Some(id) => id.clone(),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                info!("no probe id configured, generated {}", id);
                self.probe_id = Some(id.clone());
                id
            }
        }
    }

    /// Rejects settings the probe cannot run with. Must pass before any socket is opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let load = &self.load;
        if load.chunk_size == 0 {
            return Err(ConfigError::ZeroChunk);
        }
        if load.block_count() < 2 {
            return Err(ConfigError::ChunkRatio {
                chunk_size: load.chunk_size,
                file_size: load.file_size,
            });
        }
        if self.run_time_secs == 0 {
            return Err(ConfigError::ZeroValue("run_time_secs"));
        }
        if self.resource_interval_secs == 0 {
            return Err(ConfigError::ZeroValue("resource_interval_secs"));
        }
        if self.heartbeat.interval_secs == 0 {
            return Err(ConfigError::ZeroValue("heartbeat.interval_secs"));
        }
        if let Some(id) = &self.probe_id {
            if id.trim().is_empty() {
                return Err(ConfigError::EmptyIdentity);
            }
            if !is_safe_identity(id) {
                return Err(ConfigError::UnsafeIdentity(id.clone()));
            }
        }
        Ok(())
    }

    pub fn run_time(&self) -> Duration {
        Duration::from_secs(self.run_time_secs)
    }

    pub fn resource_interval(&self) -> Duration {
        Duration::from_secs(self.resource_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// The identity names a directory under `work_dir`, so it has to stay one
/// plain component there.
fn is_safe_identity(id: &str) -> bool {
    if id.len() > MAX_IDENTITY_LEN || id.chars().any(|c| c.is_control() || c == '/' || c == '\\') {
        return false;
    }
    let mut components = Path::new(id).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ProbeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.load.block_count(), 2);
        assert_eq!(config.heartbeat.interval_secs, 5);
        assert_eq!(config.load.mode, LoadMode::FileIo);
    }

    #[test]
    fn test_identity_must_stay_inside_work_dir() {
        for id in ["/", "../..", "a/b", "..", ".", "a\\b", "bench\n1"] {
            let mut config = ProbeConfig::default();
            config.probe_id = Some(id.to_string());
            assert!(
                matches!(config.validate(), Err(ConfigError::UnsafeIdentity(_))),
                "{id:?} should be rejected"
            );
        }

        let mut config = ProbeConfig::default();
        config.probe_id = Some("x".repeat(MAX_IDENTITY_LEN + 1));
        assert!(matches!(config.validate(), Err(ConfigError::UnsafeIdentity(_))));

        for id in ["bench-7", "rack2.disk0", "..hidden", "d\u{e9}bit"] {
            let mut config = ProbeConfig::default();
            config.probe_id = Some(id.to_string());
            assert!(config.validate().is_ok(), "{id:?} should be accepted");
            let dir = config.load.chunk_dir(id);
            assert_eq!(dir.parent().and_then(Path::parent), Some(config.load.work_dir.as_path()));
        }
    }

    #[test]
    fn test_chunk_ratio_rejected() {
        for (chunk_size, file_size) in [(10, 19), (10, 10), (10, 0), (3, 5), (u64::MAX, 1)] {
            let mut config = ProbeConfig::default();
            config.load.chunk_size = chunk_size;
            config.load.file_size = file_size;
            assert!(
                matches!(config.validate(), Err(ConfigError::ChunkRatio { .. })),
                "{chunk_size}/{file_size} should be rejected"
            );
        }

        let mut config = ProbeConfig::default();
        config.load.chunk_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroChunk)));
    }

    #[test]
    fn test_identity_generated_once() {
        let mut config = ProbeConfig::default();
        let first = config.resolve_identity();
        assert!(!first.is_empty());
        assert_eq!(config.resolve_identity(), first);
    }

    #[tokio::test]
    async fn test_load_yaml_with_partial_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.yaml");
        std::fs::write(
            &path,
            "probe_id: bench-7\ncollector:\n  host: 10.0.0.5\n  port: 7000\nload:\n  mode: dd\n  chunk_size: 1000\n  file_size: 5000\n",
        )
        .unwrap();

        let config = ProbeConfig::load_from(&path).await.unwrap();
        assert_eq!(config.probe_id.as_deref(), Some("bench-7"));
        assert_eq!(config.collector.port, 7000);
        assert_eq!(config.collector.connect_timeout_secs, 5);
        assert_eq!(config.load.mode, LoadMode::Dd);
        assert_eq!(config.load.block_count(), 5);
        assert_eq!(config.run_time_secs, 30);
    }

    #[tokio::test]
    async fn test_missing_file_uses_defaults_and_bad_yaml_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = ProbeConfig::load_from(&dir.path().join("nope.yaml")).await.unwrap();
        assert_eq!(missing.run_time_secs, 30);

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "load: [not, a, map]\n").unwrap();
        assert!(matches!(
            ProbeConfig::load_from(&bad).await,
            Err(ConfigError::Parse { .. })
        ));
    }
}
