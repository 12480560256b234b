use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Timeouts and sizes used by the broker core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Retry timeout when connecting to plugins for a broadcast.
    #[serde(default = "default_plugin_connect_timeout", with = "duration_ms")]
    pub plugin_connect_timeout: Duration,

    /// Retry timeout when connecting to plugins to ask them to exit.
    /// Zero fails fast: a plugin that is gone or wedged is not waited for.
    #[serde(default = "default_shutdown_connect_timeout", with = "duration_ms")]
    pub shutdown_connect_timeout: Duration,

    #[serde(default = "default_deliver_timeout", with = "duration_ms")]
    pub deliver_timeout: Duration,

    #[serde(default = "default_exit_timeout", with = "duration_ms")]
    pub exit_timeout: Duration,

    /// Delay between the plugins' exit replies and `post-exit`.
    #[serde(default = "default_post_exit_delay", with = "duration_ms")]
    pub post_exit_delay: Duration,

    #[serde(default = "default_signal_buffer_size")]
    pub signal_buffer_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            plugin_connect_timeout: default_plugin_connect_timeout(),
            shutdown_connect_timeout: default_shutdown_connect_timeout(),
            deliver_timeout: default_deliver_timeout(),
            exit_timeout: default_exit_timeout(),
            post_exit_delay: default_post_exit_delay(),
            signal_buffer_size: default_signal_buffer_size(),
        }
    }
}

impl BrokerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_str(s: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.signal_buffer_size == 0 {
            return Err(ConfigError::Invalid {
                field: "signal_buffer_size",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.deliver_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "deliver_timeout",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.exit_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "exit_timeout",
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration shared between the broker's components; replaced in place on reload.
pub type SharedConfig = Arc<RwLock<BrokerConfig>>;

pub fn shared(config: BrokerConfig) -> SharedConfig {
    Arc::new(RwLock::new(config))
}

/// Where `reload_configuration` gets a fresh configuration from.
#[cfg_attr(test, mockall::automock)]
pub trait ConfigSource: Send + Sync {
    fn reload(&self) -> ConfigResult<BrokerConfig>;
}

/// Re-reads a JSON file on every reload.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfigSource {
    fn reload(&self) -> ConfigResult<BrokerConfig> {
        BrokerConfig::from_file(&self.path)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

fn default_plugin_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_shutdown_connect_timeout() -> Duration {
    Duration::ZERO
}

fn default_deliver_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_exit_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_post_exit_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_signal_buffer_size() -> usize {
    64
}
