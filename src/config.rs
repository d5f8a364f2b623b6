//! Environment-driven configuration.
//!
//! The engine itself takes explicit option records; this module reads the
//! recognized `DROVER_*` environment keys once into a [`Configuration`]
//! that embedders use to choose storage backends and defaults.

use std::env;
use std::path::PathBuf;

use drover_core::error::{Error, Result};

/// Root directory for local file-backed storage
pub const ENV_LOCAL_STORAGE_DIR: &str = "DROVER_LOCAL_STORAGE_DIR";
/// Authentication token for the remote storage backend
pub const ENV_TOKEN: &str = "DROVER_TOKEN";
/// Override of the remote storage API base URL
pub const ENV_API_BASE_URL: &str = "DROVER_API_BASE_URL";
/// Default key-value store identifier for persisted state
pub const ENV_DEFAULT_KEY_VALUE_STORE_ID: &str = "DROVER_DEFAULT_KEY_VALUE_STORE_ID";
/// Default request queue identifier
pub const ENV_DEFAULT_REQUEST_QUEUE_ID: &str = "DROVER_DEFAULT_REQUEST_QUEUE_ID";
/// Whether the process runs on the managed platform
pub const ENV_IS_AT_HOME: &str = "DROVER_IS_AT_HOME";
/// Default headless mode for the browser backend
pub const ENV_HEADLESS: &str = "DROVER_HEADLESS";
/// Memory envelope in megabytes for the snapshotter
pub const ENV_MEMORY_MBYTES: &str = "DROVER_MEMORY_MBYTES";

/// Snapshot of the recognized environment keys
#[derive(Debug, Clone)]
pub struct Configuration {
    pub local_storage_dir: Option<PathBuf>,
    pub token: Option<String>,
    pub api_base_url: Option<String>,
    pub default_key_value_store_id: String,
    pub default_request_queue_id: String,
    pub is_at_home: bool,
    pub headless: bool,
    pub memory_mbytes: Option<u64>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            local_storage_dir: None,
            token: None,
            api_base_url: None,
            default_key_value_store_id: "default".to_string(),
            default_request_queue_id: "default".to_string(),
            is_at_home: false,
            headless: true,
            memory_mbytes: None,
        }
    }
}

impl Configuration {
    /// Read the environment. Malformed values are an error rather than a
    /// silent fallback.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            local_storage_dir: env::var_os(ENV_LOCAL_STORAGE_DIR).map(PathBuf::from),
            token: read_nonempty(ENV_TOKEN),
            api_base_url: read_nonempty(ENV_API_BASE_URL),
            default_key_value_store_id: read_nonempty(ENV_DEFAULT_KEY_VALUE_STORE_ID)
                .unwrap_or(defaults.default_key_value_store_id),
            default_request_queue_id: read_nonempty(ENV_DEFAULT_REQUEST_QUEUE_ID)
                .unwrap_or(defaults.default_request_queue_id),
            is_at_home: read_bool(ENV_IS_AT_HOME)?.unwrap_or(defaults.is_at_home),
            headless: read_bool(ENV_HEADLESS)?.unwrap_or(defaults.headless),
            memory_mbytes: read_u64(ENV_MEMORY_MBYTES)?,
        })
    }

    /// Memory envelope in bytes, when configured
    pub fn max_memory_bytes(&self) -> Option<u64> {
        self.memory_mbytes.map(|mb| mb * 1024 * 1024)
    }

    /// Whether a local storage directory is configured
    pub fn uses_local_storage(&self) -> bool {
        self.local_storage_dir.is_some()
    }
}

fn read_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn read_bool(key: &str) -> Result<Option<bool>> {
    match read_nonempty(key) {
        None => Ok(None),
        Some(value) => match value.as_str() {
            "1" | "true" | "TRUE" | "True" => Ok(Some(true)),
            "0" | "false" | "FALSE" | "False" => Ok(Some(false)),
            other => Err(Error::configuration(format!(
                "{} must be a boolean, got {:?}",
                key, other
            ))),
        },
    }
}

fn read_u64(key: &str) -> Result<Option<u64>> {
    match read_nonempty(key) {
        None => Ok(None),
        Some(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| Error::configuration(format!("{} must be an integer, got {:?}", key, value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them serialized.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn with_env<F: FnOnce()>(pairs: &[(&str, &str)], test: F) {
        let _guard = ENV_LOCK.lock().unwrap();
        for (key, value) in pairs {
            env::set_var(key, value);
        }
        test();
        for (key, _) in pairs {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_defaults() {
        with_env(&[], || {
            let config = Configuration::from_env().unwrap();
            assert!(!config.is_at_home);
            assert!(config.headless);
            assert_eq!(config.default_request_queue_id, "default");
            assert!(config.memory_mbytes.is_none());
            assert!(!config.uses_local_storage());
        });
    }

    #[test]
    fn test_reads_values() {
        with_env(
            &[
                (ENV_LOCAL_STORAGE_DIR, "/tmp/drover-storage"),
                (ENV_TOKEN, "secret"),
                (ENV_IS_AT_HOME, "1"),
                (ENV_HEADLESS, "false"),
                (ENV_MEMORY_MBYTES, "2048"),
            ],
            || {
                let config = Configuration::from_env().unwrap();
                assert!(config.uses_local_storage());
                assert_eq!(config.token.as_deref(), Some("secret"));
                assert!(config.is_at_home);
                assert!(!config.headless);
                assert_eq!(config.max_memory_bytes(), Some(2048 * 1024 * 1024));
            },
        );
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        with_env(&[(ENV_MEMORY_MBYTES, "lots")], || {
            assert!(Configuration::from_env().is_err());
        });
        with_env(&[(ENV_HEADLESS, "maybe")], || {
            assert!(Configuration::from_env().is_err());
        });
    }
}
