use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::error::ConfigError;
use crate::queue::GetOptions;

/// Files tried, in order, when no config path is given.
pub const CONFIG_SEARCH_PATHS: [&str; 2] = ["docq.toml", "/etc/docq/docq.toml"];

/// Environment variable overriding `storage.data_dir`.
pub const DATA_DIR_ENV: &str = "DOCQ_DATA_DIR";

/// Top-level configuration, deserializable from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DocqConfig {
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
}

/// Where the RocksDB store lives.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
}

/// Queue defaults (collection name, lease and polling).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub collection: String,
    pub lease_ms: u64,
    pub wait_ms: u64,
    pub poll_ms: u64,
}

/// The `docq-server` process that owns the store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
}

/// How clients reach `docq-server`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub addr: String,
}

impl DocqConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Load `explicit` if given, else the first of [`CONFIG_SEARCH_PATHS`]
    /// that exists, else the defaults. `DOCQ_DATA_DIR` overrides the data
    /// directory either way.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let found = explicit.or_else(|| {
            CONFIG_SEARCH_PATHS
                .iter()
                .map(Path::new)
                .find(|path| path.exists())
        });
        let mut config = match found {
            Some(path) => {
                let config = Self::from_file(path)?;
                info!(path = %path.display(), "loaded configuration");
                config
            }
            None => {
                info!("no config file found, using defaults");
                Self::default()
            }
        };

        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            config.storage.data_dir = dir;
        }
        Ok(config)
    }

    /// `get` options built from the `[queue]` section.
    pub fn get_options(&self) -> GetOptions {
        GetOptions::new(Duration::from_millis(self.queue.lease_ms))
            .wait(Duration::from_millis(self.queue.wait_ms))
            .poll(Duration::from_millis(self.queue.poll_ms))
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5580".to_string(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: "http://127.0.0.1:5580".to_string(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            collection: "messages".to_string(),
            lease_ms: 30_000,
            wait_ms: GetOptions::DEFAULT_WAIT.as_millis() as u64,
            poll_ms: GetOptions::DEFAULT_POLL.as_millis() as u64,
        }
    }
}
