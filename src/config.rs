//! Runtime configuration.
//!
//! Read from an optional JSON file (camelCase keys, every field optional),
//! then overridden by `POS_SYNC_*` environment variables.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::api::normalize_server_url;
use crate::error::{Error, Result};
use crate::history::DEFAULT_HISTORY_LIMIT;
use crate::pending::DEFAULT_MAX_ATTEMPTS;
use crate::sync::SyncSettings;

pub const ENV_SERVER_URL: &str = "POS_SYNC_SERVER_URL";
pub const ENV_API_KEY: &str = "POS_SYNC_API_KEY";
pub const ENV_DATA_DIR: &str = "POS_SYNC_DATA_DIR";
pub const ENV_LOG_DIR: &str = "POS_SYNC_LOG_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub server_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub data_dir: PathBuf,
    /// Defaults to `{dataDir}/logs`.
    pub log_dir: Option<PathBuf>,
    pub request_timeout_secs: u64,
    pub connectivity_timeout_secs: u64,
    pub reconnect_settle_ms: u64,
    pub periodic_interval_secs: u64,
    pub network_poll_secs: u64,
    pub max_attempts: i64,
    pub transaction_cache_limit: usize,
    pub credential_hash_cost: u32,
    pub sync_log_retention: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            api_key: String::new(),
            data_dir: PathBuf::from("./data"),
            log_dir: None,
            request_timeout_secs: 30,
            connectivity_timeout_secs: 5,
            reconnect_settle_ms: 2000,
            periodic_interval_secs: 30,
            network_poll_secs: 15,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            transaction_cache_limit: DEFAULT_HISTORY_LIMIT,
            credential_hash_cost: bcrypt::DEFAULT_COST,
            sync_log_retention: 200,
        }
    }
}

impl SyncConfig {
    /// Load `path` if given, apply environment overrides, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)?;
                let parsed: SyncConfig = serde_json::from_str(&raw)?;
                info!(path = %path.display(), "Loaded sync config");
                parsed
            }
            None => SyncConfig::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = lookup(ENV_SERVER_URL) {
            self.server_url = v;
        }
        if let Some(v) = lookup(ENV_API_KEY) {
            self.api_key = v;
        }
        if let Some(v) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_LOG_DIR) {
            self.log_dir = Some(PathBuf::from(v));
        }
    }

    /// Reject values the engine cannot run with, and normalise the URL.
    pub fn validate(&mut self) -> Result<()> {
        self.server_url = normalize_server_url(&self.server_url);
        if self.max_attempts <= 0 {
            return Err(Error::Config("maxAttempts must be at least 1".into()));
        }
        if self.request_timeout_secs == 0 || self.connectivity_timeout_secs == 0 {
            return Err(Error::Config("timeouts must be non-zero".into()));
        }
        if self.periodic_interval_secs == 0 || self.network_poll_secs == 0 {
            return Err(Error::Config("intervals must be non-zero".into()));
        }
        if self.transaction_cache_limit == 0 {
            return Err(Error::Config("transactionCacheLimit must be at least 1".into()));
        }
        if !(4..=31).contains(&self.credential_hash_cost) {
            return Err(Error::Config(
                "credentialHashCost must be between 4 and 31".into(),
            ));
        }
        Ok(())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("logs"))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connectivity_timeout(&self) -> Duration {
        Duration::from_secs(self.connectivity_timeout_secs)
    }

    pub fn network_poll_interval(&self) -> Duration {
        Duration::from_secs(self.network_poll_secs)
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            max_attempts: self.max_attempts,
            request_timeout: self.request_timeout(),
            reconnect_settle: Duration::from_millis(self.reconnect_settle_ms),
            periodic_interval: Duration::from_secs(self.periodic_interval_secs),
            history_limit: self.transaction_cache_limit,
            sync_log_retention: self.sync_log_retention,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        fs::write(
            &path,
            r#"{ "serverUrl": "pos.example.com/api/", "maxAttempts": 3 }"#,
        )
        .unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let mut config: SyncConfig = serde_json::from_str(&raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server_url, "https://pos.example.com");
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.log_dir(), PathBuf::from("./data").join("logs"));
        assert_eq!(config.sync_settings().reconnect_settle, Duration::from_secs(2));
    }

    #[test]
    fn overrides_replace_file_values() {
        let env: HashMap<&str, &str> = [
            (ENV_SERVER_URL, "http://localhost:8000"),
            (ENV_DATA_DIR, "/var/lib/pos"),
            (ENV_API_KEY, "  "),
        ]
        .into_iter()
        .collect();
        let mut config = SyncConfig {
            api_key: "from-file".into(),
            ..Default::default()
        };
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.server_url, "http://localhost:8000");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/pos"));
        assert_eq!(config.api_key, "from-file");
    }

    #[test]
    fn validation_rejects_unusable_values() {
        let mut config = SyncConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = SyncConfig {
            credential_hash_cost: 2,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = SyncConfig {
            transaction_cache_limit: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn api_key_is_not_serialized() {
        let config = SyncConfig {
            api_key: "secret".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }
}
