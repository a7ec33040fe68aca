//! Ledger configuration
//!
//! Defaults suit a desktop install; every field can be overridden from the
//! environment (a `.env` file is loaded first when present).

use crate::ledger::JsonOpStore;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const ENV_STORE_DIR: &str = "TREESYNC_STORE_DIR";
pub const ENV_CANCEL_PENDING_ON_STARTUP: &str = "TREESYNC_CANCEL_PENDING_ON_STARTUP";
pub const ENV_RM_TO_TRASH: &str = "TREESYNC_RM_TO_TRASH";
pub const ENV_WORKERS: &str = "TREESYNC_WORKERS";

/// Settings for `OpLedger` and its worker pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LedgerConfig {
    /// Directory of the durable pending-op store
    pub store_dir: PathBuf,
    /// Archive persisted operations as cancelled instead of resuming them
    pub cancel_pending_on_startup: bool,
    /// Send removed nodes to the trash rather than deleting them
    pub rm_to_trash: bool,
    /// Number of workers draining the ledger
    pub worker_count: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            store_dir: JsonOpStore::default_dir(),
            cancel_pending_on_startup: false,
            rm_to_trash: true,
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .max(1),
        }
    }
}

impl LedgerConfig {
    /// Defaults overridden by `TREESYNC_*` variables from the process
    /// environment or a `.env` file
    pub fn from_env() -> Self {
        if dotenvy::dotenv().is_err() {
            tracing::debug!("No .env file found, using process environment");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    /// Unparseable values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup(ENV_STORE_DIR).filter(|d| !d.trim().is_empty()) {
            config.store_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup(ENV_CANCEL_PENDING_ON_STARTUP) {
            match parse_bool(&value) {
                Some(flag) => config.cancel_pending_on_startup = flag,
                None => tracing::warn!(key = ENV_CANCEL_PENDING_ON_STARTUP, value = %value, "Ignoring invalid boolean"),
            }
        }
        if let Some(value) = lookup(ENV_RM_TO_TRASH) {
            match parse_bool(&value) {
                Some(flag) => config.rm_to_trash = flag,
                None => tracing::warn!(key = ENV_RM_TO_TRASH, value = %value, "Ignoring invalid boolean"),
            }
        }
        if let Some(value) = lookup(ENV_WORKERS) {
            match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.worker_count = n,
                _ => tracing::warn!(key = ENV_WORKERS, value = %value, "Ignoring invalid worker count"),
            }
        }

        config
    }

    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = dir.into();
        self
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = LedgerConfig::default();
        assert!(!config.cancel_pending_on_startup);
        assert!(config.rm_to_trash);
        assert!(config.worker_count >= 1);
        assert!(config.store_dir.ends_with("treesync/ops"));
    }

    #[test]
    fn test_env_overrides() {
        let config = LedgerConfig::from_lookup(lookup(&[
            (ENV_STORE_DIR, "/tmp/ops"),
            (ENV_CANCEL_PENDING_ON_STARTUP, "yes"),
            (ENV_RM_TO_TRASH, "0"),
            (ENV_WORKERS, "3"),
        ]));
        assert_eq!(config.store_dir, PathBuf::from("/tmp/ops"));
        assert!(config.cancel_pending_on_startup);
        assert!(!config.rm_to_trash);
        assert_eq!(config.worker_count, 3);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let defaults = LedgerConfig::default();
        let config = LedgerConfig::from_lookup(lookup(&[(ENV_RM_TO_TRASH, "maybe"), (ENV_WORKERS, "0")]));
        assert_eq!(config.rm_to_trash, defaults.rm_to_trash);
        assert_eq!(config.worker_count, defaults.worker_count);
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: LedgerConfig = serde_json::from_str(r#"{"rmToTrash": false}"#).unwrap();
        assert!(!config.rm_to_trash);
        assert!(!config.cancel_pending_on_startup);
    }
}
