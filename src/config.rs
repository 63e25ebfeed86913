//! Engine configuration.
//!
//! Resolved in three layers: built-in defaults, then the `sync` category of
//! `local_settings`, then `POS_SYNC_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use crate::db::Database;
use crate::error::Result;
use crate::sync::RetryPolicy;

const SETTINGS_CATEGORY: &str = "sync";
const ENV_PREFIX: &str = "POS_SYNC_";

/// Keys accepted from `local_settings` and the environment.
const KEYS: &[&str] = &[
    "api_base_url",
    "api_token",
    "health_path",
    "transactions_path",
    "probe_interval_secs",
    "probe_timeout_secs",
    "submit_timeout_secs",
    "sync_interval_secs",
    "max_retries",
    "base_backoff_ms",
    "probe_failure_threshold",
    "db_path",
    "log_dir",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub api_base_url: String,
    /// Bearer token for the transaction endpoint; auth itself is handled
    /// elsewhere.
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    pub health_path: String,
    pub transactions_path: String,
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub submit_timeout_secs: u64,
    pub sync_interval_secs: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    /// Consecutive contradicting signals needed to flip reachable → offline.
    pub probe_failure_threshold: u32,
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".into(),
            api_token: None,
            health_path: "/health".into(),
            transactions_path: "/transactions/".into(),
            probe_interval_secs: 30,
            probe_timeout_secs: 5,
            submit_timeout_secs: 30,
            sync_interval_secs: 5,
            max_retries: 5,
            base_backoff_ms: 1_000,
            probe_failure_threshold: 2,
            db_path: PathBuf::from("data/pos-queue.db"),
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay persisted settings, then re-apply the environment so it keeps
    /// the highest precedence.
    pub fn apply_local_settings(&mut self, db: &Database) -> Result<()> {
        for key in KEYS {
            if let Some(value) = db.local_setting_get(SETTINGS_CATEGORY, key)? {
                self.set(key, &value, "local_settings");
            }
        }
        self.apply_env();
        Ok(())
    }

    fn apply_env(&mut self) {
        for key in KEYS {
            let var = format!("{ENV_PREFIX}{}", key.to_uppercase());
            if let Ok(value) = std::env::var(&var) {
                self.set(key, &value, "environment");
            }
        }
    }

    /// Apply one override. Unparseable values are logged and ignored so a
    /// typo never stops the till from starting.
    fn set(&mut self, key: &str, value: &str, source: &str) {
        let value = value.trim();
        let applied = match key {
            "api_base_url" => {
                self.api_base_url = value.to_string();
                true
            }
            "api_token" => {
                self.api_token = Some(value.to_string()).filter(|v| !v.is_empty());
                true
            }
            "health_path" => {
                self.health_path = value.to_string();
                true
            }
            "transactions_path" => {
                self.transactions_path = value.to_string();
                true
            }
            "probe_interval_secs" => parse_into(value, &mut self.probe_interval_secs),
            "probe_timeout_secs" => parse_into(value, &mut self.probe_timeout_secs),
            "submit_timeout_secs" => parse_into(value, &mut self.submit_timeout_secs),
            "sync_interval_secs" => parse_into(value, &mut self.sync_interval_secs),
            "max_retries" => parse_into(value, &mut self.max_retries),
            "base_backoff_ms" => parse_into(value, &mut self.base_backoff_ms),
            "probe_failure_threshold" => parse_into(value, &mut self.probe_failure_threshold),
            "db_path" => {
                self.db_path = PathBuf::from(value);
                true
            }
            "log_dir" => {
                self.log_dir = PathBuf::from(value);
                true
            }
            _ => false,
        };

        if applied {
            debug!(key, source, "Applied config override");
        } else {
            warn!(key, source, "Ignoring invalid config value");
        }
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs.max(1))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.max(1),
            base_backoff: Duration::from_millis(self.base_backoff_ms),
        }
    }
}

fn parse_into<T: std::str::FromStr>(value: &str, slot: &mut T) -> bool {
    match value.parse::<T>() {
        Ok(parsed) => {
            *slot = parsed;
            true
        }
        Err(_) => false,
    }
}
