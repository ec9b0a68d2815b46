use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_derive::Deserialize;
use thiserror::Error;
use tokio::sync::watch;

pub const DEFAULT_BROKER: &str = "localhost:1883";
pub const DEFAULT_TOPIC: &str = "ble_beacons";
pub const DEFAULT_SCAN_TIMEOUT_MS: u64 = 1000;

/// Environment variable overriding `broker.address`.
pub const BROKER_ENV: &str = "BLE_BROKER";
/// Environment variable overriding `broker.topic`.
pub const TOPIC_ENV: &str = "BLE_TOPIC";

const DEFAULT_CONFIG_FILE: &str = r#"[broker]
address = "localhost:1883"
topic = "ble_beacons"

[scan]
timeout_ms = 1000
interscan_delay_ms = 0
"#;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Error parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub scan: ScanConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct BrokerConfig {
    #[serde(default = "default_broker")]
    pub address: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    pub client_id: Option<String>,
    pub keep_alive_seconds: Option<u64>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            address: default_broker(),
            topic: default_topic(),
            client_id: None,
            keep_alive_seconds: None,
            username: None,
            password: None,
        }
    }
}

fn default_broker() -> String {
    DEFAULT_BROKER.to_string()
}

fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    pub timeout_ms: Option<u64>,
    pub interscan_delay_ms: Option<u64>,
}

impl ScanConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_SCAN_TIMEOUT_MS))
    }

    pub fn interscan_delay(&self) -> Duration {
        Duration::from_millis(self.interscan_delay_ms.unwrap_or(0))
    }
}

/// The broker settings in effect for a scan run. Replaced only as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub broker: String,
    pub topic: String,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        ConfigSnapshot {
            broker: default_broker(),
            topic: default_topic(),
        }
    }
}

impl ConfigSnapshot {
    /// Resolve a snapshot from the file config, then apply `lookup` overrides.
    pub fn resolve<F>(config: &AppConfig, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let snapshot = ConfigSnapshot {
            broker: lookup(BROKER_ENV).unwrap_or_else(|| config.broker.address.clone()),
            topic: lookup(TOPIC_ENV).unwrap_or_else(|| config.broker.topic.clone()),
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.trim().is_empty() {
            return Err(ConfigError::Invalid("broker address is empty".to_string()));
        }
        if self.topic.trim().is_empty() {
            return Err(ConfigError::Invalid("topic is empty".to_string()));
        }
        Ok(())
    }
}

/// Where snapshots come from on reload.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<ConfigSnapshot, ConfigError>;
}

/// TOML file config with environment overrides.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileConfigSource { path: path.into() }
    }

    /// `~/.ble/config.toml`, or `./config.toml` when no home directory is known.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|home| home.join(".ble").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the whole file, writing the default one first if absent.
    pub fn app_config(&self) -> Result<AppConfig, ConfigError> {
        ensure_default_file(&self.path);

        let contents = fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;

        let config = toml::de::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;
        debug!("Loaded configuration from {}", self.path.display());
        Ok(config)
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<ConfigSnapshot, ConfigError> {
        let config = self.app_config()?;
        ConfigSnapshot::resolve(&config, |key| std::env::var(key).ok())
    }
}

fn ensure_default_file(path: &Path) {
    if path.exists() {
        return;
    }

    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        if let Err(err) = fs::create_dir_all(dir) {
            warn!("Error creating config directory {}: {}", dir.display(), err);
            return;
        }
    }

    match fs::write(path, DEFAULT_CONFIG_FILE) {
        Ok(()) => info!("Created default configuration at {}", path.display()),
        Err(err) => warn!("Error creating config file {}: {}", path.display(), err),
    }
}

/// Atomically swappable holder of the current [`ConfigSnapshot`].
///
/// Readers get an `Arc` to a complete snapshot; a reload publishes a new one
/// without touching snapshots already handed out.
#[derive(Debug)]
pub struct ConfigCell {
    tx: watch::Sender<Arc<ConfigSnapshot>>,
}

impl ConfigCell {
    pub fn new(initial: ConfigSnapshot) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        ConfigCell { tx }
    }

    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn replace(&self, snapshot: ConfigSnapshot) -> Arc<ConfigSnapshot> {
        let snapshot = Arc::new(snapshot);
        self.tx.send_replace(snapshot.clone());
        snapshot
    }

    /// Load a fresh snapshot; on failure the current one stays in effect.
    pub fn reload(&self, source: &dyn ConfigSource) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        let snapshot = source.load()?;
        info!(
            "Reloaded configuration - broker: {}, topic: {}",
            snapshot.broker, snapshot.topic
        );
        Ok(self.replace(snapshot))
    }

    /// Receiver notified on every replacement.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ConfigSnapshot>> {
        self.tx.subscribe()
    }
}
