use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use hwmgr_reconcile::{RetryPolicy, DEFAULT_CALL_DEADLINE, DEFAULT_CONFLICT_ATTEMPTS, DEFAULT_RESYNC_INTERVAL};

/// Namespace used when neither `HWMGR_NAMESPACE` nor `MY_POD_NAMESPACE` is set.
pub const DEFAULT_NAMESPACE: &str = "hwmgr";

/// Default location of the SQLite state file.
pub const DEFAULT_STATE_PATH: &str = "/var/lib/hwmgr/state.db";

#[derive(Debug, Clone)]
pub struct Config {
    /// Controller namespace: holds the inventory record and the Nodes.
    pub namespace: String,
    pub state_path: PathBuf,
    pub log_level: String,
    /// Hardware catalog loaded into the inventory record at startup.
    pub profiles_file: Option<PathBuf>,
    pub resync_interval: Duration,
    pub store_timeout: Duration,
    pub conflict_retries: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let namespace = std::env::var("HWMGR_NAMESPACE")
            .or_else(|_| std::env::var("MY_POD_NAMESPACE"))
            .unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());

        let state_path = std::env::var("HWMGR_STATE_PATH")
            .unwrap_or_else(|_| DEFAULT_STATE_PATH.to_string())
            .into();

        let log_level = std::env::var("HWMGR_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let profiles_file = std::env::var("HWMGR_PROFILES_FILE").ok().map(PathBuf::from);

        let resync_interval = match std::env::var("HWMGR_RESYNC_INTERVAL_SECS") {
            Ok(v) => Duration::from_secs(
                v.parse()
                    .context("HWMGR_RESYNC_INTERVAL_SECS must be a whole number of seconds")?,
            ),
            Err(_) => DEFAULT_RESYNC_INTERVAL,
        };

        let store_timeout = match std::env::var("HWMGR_STORE_TIMEOUT_MS") {
            Ok(v) => Duration::from_millis(
                v.parse()
                    .context("HWMGR_STORE_TIMEOUT_MS must be a whole number of milliseconds")?,
            ),
            Err(_) => DEFAULT_CALL_DEADLINE,
        };

        let conflict_retries = match std::env::var("HWMGR_CONFLICT_RETRIES") {
            Ok(v) => v.parse().context("HWMGR_CONFLICT_RETRIES must be a number")?,
            Err(_) => DEFAULT_CONFLICT_ATTEMPTS,
        };

        Ok(Self {
            namespace,
            state_path,
            log_level,
            profiles_file,
            resync_interval,
            store_timeout,
            conflict_retries,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.conflict_retries,
            ..RetryPolicy::default()
        }
    }
}
