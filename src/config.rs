//! TOML configuration for the store, engine, client cache and locales.
//! Every section and field is optional; missing values fall back to defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub engine: EngineConfig,
    pub client: ClientConfig,
    pub locale: LocaleConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file.
    pub path: PathBuf,
    /// Age after which a placeholder counts as stuck and may be reclaimed.
    pub placeholder_ttl_secs: u64,
    /// Interval of the background placeholder sweep.
    pub cleanup_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("translations.db"),
            placeholder_ttl_secs: 300,
            cleanup_interval_secs: 3600,
        }
    }
}

impl StoreConfig {
    pub fn placeholder_ttl(&self) -> Duration {
        Duration::from_secs(self.placeholder_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of an OpenAI-compatible chat-completions API.
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    /// Upper bound on a single engine call, retries included.
    pub timeout_secs: u64,
    /// Minimum spacing between requests (token bucket).
    pub min_interval_ms: u64,
    pub max_retries: u32,
    /// Engine name recorded as `producedBy` on completed records.
    pub name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com".into(),
            model: "deepseek-chat".into(),
            api_key_env: "TRANSLATE_API_KEY".into(),
            timeout_secs: 30,
            min_interval_ms: 100,
            max_retries: 3,
            name: "deepseek-chat".into(),
        }
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    /// Bound on one background fill: every attempt may run to the request
    /// timeout. `None` when it does not fit in a `Duration`.
    pub fn fill_timeout(&self) -> Option<Duration> {
        self.max_retries
            .checked_add(1)
            .and_then(|attempts| self.timeout().checked_mul(attempts))
    }
}

/// Largest `engine.max_retries` accepted by validation.
pub const MAX_ENGINE_RETRIES: u32 = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// LRU capacity of the client-held map.
    pub capacity: usize,
    pub poll_interval_ms: u64,
    /// Re-queries per key before the client forgets it.
    pub max_polls: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            capacity: 512,
            poll_interval_ms: 1500,
            max_polls: 20,
        }
    }
}

impl ClientConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocaleConfig {
    /// Locale the original content is authored in.
    pub source: String,
}

impl Default for LocaleConfig {
    fn default() -> Self {
        Self { source: "en".into() }
    }
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate config from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, bool); 5] = [
            ("store.placeholder_ttl_secs", self.store.placeholder_ttl_secs > 0),
            ("store.cleanup_interval_secs", self.store.cleanup_interval_secs > 0),
            ("engine.timeout_secs", self.engine.timeout_secs > 0),
            ("client.capacity", self.client.capacity > 0),
            ("client.poll_interval_ms", self.client.poll_interval_ms > 0),
        ];
        for (field, ok) in checks {
            if !ok {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be > 0".into(),
                });
            }
        }
        if self.engine.max_retries > MAX_ENGINE_RETRIES {
            return Err(ConfigError::Invalid {
                field: "engine.max_retries",
                reason: format!("must be at most {MAX_ENGINE_RETRIES}"),
            });
        }
        let fill_timeout = self.engine.fill_timeout().ok_or(ConfigError::Invalid {
            field: "engine.timeout_secs",
            reason: "timeout times attempts overflows".into(),
        })?;
        // A placeholder must outlive its fill or a second reader reclaims it mid-flight.
        if self.store.placeholder_ttl() <= fill_timeout {
            return Err(ConfigError::Invalid {
                field: "store.placeholder_ttl_secs",
                reason: format!(
                    "must exceed the fill bound of {}s (timeout_secs * (max_retries + 1))",
                    fill_timeout.as_secs()
                ),
            });
        }
        if self.locale.source.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "locale.source",
                reason: "must not be empty".into(),
            });
        }
        if self.engine.name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "engine.name",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }
}
