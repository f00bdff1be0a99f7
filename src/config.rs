//! Runtime settings for the sync core.
//!
//! Precedence: defaults, then the JSON file named by `SHIFTCHECK_CONFIG`, then
//! individual `SHIFTCHECK_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_CONFIG_FILE: &str = "SHIFTCHECK_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{var} has invalid value `{value}`")]
    InvalidEnv { var: String, value: String },
    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub server_url: String,
    pub tenant_id: Option<String>,
    /// Limits bulk task refreshes to one area when set.
    pub area_id: Option<String>,
    pub api_token: Option<String>,
    pub db_path: Option<PathBuf>,
    /// Upper bound on queue entries submitted per pass.
    pub batch_size: usize,
    pub request_timeout_ms: u64,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub online_debounce_ms: u64,
    pub full_refresh_after_hours: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080/api".to_string(),
            tenant_id: None,
            area_id: None,
            api_token: None,
            db_path: None,
            batch_size: 50,
            request_timeout_ms: 15_000,
            retry_base_ms: 2_000,
            retry_max_ms: 300_000,
            online_debounce_ms: 250,
            full_refresh_after_hours: 24,
        }
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv {
            var: var.to_string(),
            value,
        })
}

impl SyncConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the process environment.
    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup(ENV_CONFIG_FILE) {
            Some(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        config.apply_env(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("SHIFTCHECK_SERVER_URL") {
            self.server_url = v.trim().to_string();
        }
        if let Some(v) = get("SHIFTCHECK_TENANT_ID") {
            self.tenant_id = Some(v.trim().to_string());
        }
        if let Some(v) = get("SHIFTCHECK_AREA_ID") {
            self.area_id = Some(v.trim().to_string());
        }
        if let Some(v) = get("SHIFTCHECK_API_TOKEN") {
            self.api_token = Some(v.trim().to_string());
        }
        if let Some(v) = get("SHIFTCHECK_DB_PATH") {
            self.db_path = Some(PathBuf::from(v.trim()));
        }
        if let Some(v) = get("SHIFTCHECK_BATCH_SIZE") {
            self.batch_size = parse_env("SHIFTCHECK_BATCH_SIZE", v)?;
        }
        if let Some(v) = get("SHIFTCHECK_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = parse_env("SHIFTCHECK_REQUEST_TIMEOUT_MS", v)?;
        }
        if let Some(v) = get("SHIFTCHECK_RETRY_BASE_MS") {
            self.retry_base_ms = parse_env("SHIFTCHECK_RETRY_BASE_MS", v)?;
        }
        if let Some(v) = get("SHIFTCHECK_RETRY_MAX_MS") {
            self.retry_max_ms = parse_env("SHIFTCHECK_RETRY_MAX_MS", v)?;
        }
        if let Some(v) = get("SHIFTCHECK_ONLINE_DEBOUNCE_MS") {
            self.online_debounce_ms = parse_env("SHIFTCHECK_ONLINE_DEBOUNCE_MS", v)?;
        }
        if let Some(v) = get("SHIFTCHECK_FULL_REFRESH_AFTER_HOURS") {
            self.full_refresh_after_hours = parse_env("SHIFTCHECK_FULL_REFRESH_AFTER_HOURS", v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.retry_base_ms == 0 {
            return Err(ConfigError::Invalid("retry_base_ms must be positive".into()));
        }
        if self.retry_max_ms < self.retry_base_ms {
            return Err(ConfigError::Invalid(format!(
                "retry_max_ms ({}) is below retry_base_ms ({})",
                self.retry_max_ms, self.retry_base_ms
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be positive".into()));
        }
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::Invalid("server_url is empty".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn online_debounce(&self) -> Duration {
        Duration::from_millis(self.online_debounce_ms)
    }

    /// Delay before retry number `failures` (1-based): doubling from
    /// `retry_base_ms`, capped at `retry_max_ms`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(20);
        let delay = self.retry_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.retry_max_ms))
    }

    pub fn full_refresh_after(&self) -> chrono::TimeDelta {
        i64::try_from(self.full_refresh_after_hours)
            .ok()
            .and_then(chrono::TimeDelta::try_hours)
            .unwrap_or(chrono::TimeDelta::MAX)
    }
}
