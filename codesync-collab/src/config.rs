//! Server configuration.
//!
//! Every field has a default, so an empty TOML file is a valid config:
//!
//! ```toml
//! bind_addr = "0.0.0.0:8001"
//! gc_ceiling = 200
//! idle_grace_secs = 300
//! debounce_ms = 500
//! redis_url = "redis://127.0.0.1:6379"
//! broker_timeout_ms = 2000
//! broker_backoff_ms = 1000
//! storage_path = "codesync_data"
//!
//! [analysis]
//! model = "arcee-ai/trinity-large-preview:free"
//! timeout_secs = 30
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::update_log::DEFAULT_GC_CEILING;

/// Environment variable consulted when no API key is configured.
pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Settings for the text-analysis service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// OpenAI-compatible chat completions URL
    pub endpoint: String,
    /// Bearer token. Falls back to `OPENROUTER_API_KEY`.
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            api_key: None,
            model: "arcee-ai/trinity-large-preview:free".to_string(),
            timeout_secs: 30,
        }
    }
}

impl AnalysisConfig {
    /// Configured key, else the environment. Blank keys count as absent.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|key| !key.trim().is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before it counts as unresponsive
    pub outbox_capacity: usize,
    /// Update log compaction threshold (blob count)
    pub gc_ceiling: usize,
    /// Seconds an empty document is kept before eviction
    pub idle_grace_secs: u64,
    /// Delay between the last edit and the analysis call
    pub debounce_ms: u64,
    /// Broker URL. `None` runs single-instance.
    pub redis_url: Option<String>,
    /// Upper bound on one broker publish or subscribe
    pub broker_timeout_ms: u64,
    /// Resubscribe delay, and how long publishing pauses after a failure
    pub broker_backoff_ms: u64,
    /// RocksDB directory. `None` keeps documents in memory.
    pub storage_path: Option<PathBuf>,
    pub analysis: AnalysisConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8001".to_string(),
            outbox_capacity: 1024,
            gc_ceiling: DEFAULT_GC_CEILING,
            idle_grace_secs: 300,
            debounce_ms: 500,
            redis_url: None,
            broker_timeout_ms: 2000,
            broker_backoff_ms: 1000,
            storage_path: None,
            analysis: AnalysisConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Loopback on an OS-assigned port with short timers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            outbox_capacity: 256,
            idle_grace_secs: 1,
            debounce_ms: 50,
            broker_timeout_ms: 200,
            broker_backoff_ms: 50,
            analysis: AnalysisConfig {
                endpoint: "http://127.0.0.1:9/unused".to_string(),
                // Blank, so the environment key is never picked up.
                api_key: Some(String::new()),
                timeout_secs: 2,
                ..AnalysisConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.idle_grace_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn broker_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_timeout_ms)
    }

    pub fn broker_backoff(&self) -> Duration {
        Duration::from_millis(self.broker_backoff_ms)
    }
}
