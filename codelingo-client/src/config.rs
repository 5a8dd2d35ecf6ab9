//! Configuration loading for the CodeLingo client.
//!
//! All fields are required. No defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub api_url: String,
    pub api_version: String,
    pub request_timeout_ms: u64,
    pub storage_dir: PathBuf,
    pub cache: CacheSettings,
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    pub stale_after_ms: u64,
    pub expire_after_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    pub query_max_retries: u32,
    pub mutation_max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or CODELINGO_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ClientConfig {
    /// Load from `explicit` (the `--config` flag) or `CODELINGO_CONFIG`.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = explicit.map(Path::to_path_buf).or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let api_url = self.api_url.trim();
        if api_url.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "api_url",
                reason: "must not be empty".to_string(),
            });
        }
        if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                field: "api_url",
                reason: "must start with http:// or https://".to_string(),
            });
        }
        if self.api_version.trim().is_empty() || self.api_version.contains('/') {
            return Err(ConfigError::InvalidValue {
                field: "api_version",
                reason: "must be a single non-empty path segment".to_string(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.storage_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "storage_dir",
                reason: "must not be empty".to_string(),
            });
        }
        if self.cache.stale_after_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.stale_after_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.cache.expire_after_ms < self.cache.stale_after_ms {
            return Err(ConfigError::InvalidValue {
                field: "cache.expire_after_ms",
                reason: "must be >= stale_after_ms".to_string(),
            });
        }
        if self.retry.mutation_max_retries > 1 {
            return Err(ConfigError::InvalidValue {
                field: "retry.mutation_max_retries",
                reason: "mutations retry at most once".to_string(),
            });
        }
        if self.retry.base_delay_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.base_delay_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_delay_ms",
                reason: "must be >= base_delay_ms".to_string(),
            });
        }
        Ok(())
    }

    /// `{api_url}/{api_version}` without a trailing slash.
    pub fn api_base(&self) -> String {
        format!(
            "{}/{}",
            self.api_url.trim().trim_end_matches('/'),
            self.api_version.trim()
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new(
            Duration::from_millis(self.cache.stale_after_ms),
            Duration::from_millis(self.cache.expire_after_ms),
        )
    }

    pub fn query_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.query_max_retries,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }

    pub fn mutation_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.mutation_max_retries,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("CODELINGO_CONFIG").ok().map(PathBuf::from)
}
