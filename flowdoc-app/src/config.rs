//! Application configuration.
//!
//! Defaults suit a desktop install; every field can be overridden from a
//! `FLOWDOC_*` environment variable.
//!
//! | Variable                        | Field                          |
//! |---------------------------------|--------------------------------|
//! | `FLOWDOC_DATA_DIR`              | `data_dir` (RocksDB directory) |
//! | `FLOWDOC_SERVER_URL`            | `server_url`                   |
//! | `FLOWDOC_OFFLINE`               | `!start_online`                |
//! | `FLOWDOC_ANALYSIS_TIMEOUT_SECS` | `store.analysis_timeout`       |
//! | `FLOWDOC_MAX_RETRIES`           | `queue.max_retries`            |
//! | `FLOWDOC_SYNC_INTERVAL_SECS`    | `queue.periodic_interval`      |
//! | `FLOWDOC_SETTLE_MS`             | `reachability.settle`          |
//! | `FLOWDOC_CONNECT_DELAY_MS`      | `session.connect_delay`        |

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use flowdoc_sync::{QueueConfig, ReachabilityConfig, SessionConfig};

use crate::store::StoreConfig;

pub const ENV_DATA_DIR: &str = "FLOWDOC_DATA_DIR";
pub const ENV_SERVER_URL: &str = "FLOWDOC_SERVER_URL";
pub const ENV_OFFLINE: &str = "FLOWDOC_OFFLINE";
pub const ENV_ANALYSIS_TIMEOUT_SECS: &str = "FLOWDOC_ANALYSIS_TIMEOUT_SECS";
pub const ENV_MAX_RETRIES: &str = "FLOWDOC_MAX_RETRIES";
pub const ENV_SYNC_INTERVAL_SECS: &str = "FLOWDOC_SYNC_INTERVAL_SECS";
pub const ENV_SETTLE_MS: &str = "FLOWDOC_SETTLE_MS";
pub const ENV_CONNECT_DELAY_MS: &str = "FLOWDOC_CONNECT_DELAY_MS";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// RocksDB directory. In-memory storage when unset.
    pub data_dir: Option<PathBuf>,
    /// Collaboration relay base URL; the document id is appended.
    pub server_url: String,
    /// Reachability assumed until the platform reports otherwise.
    pub start_online: bool,
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub reachability: ReachabilityConfig,
    pub session: SessionConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: Some(PathBuf::from("flowdoc_data")),
            server_url: "ws://localhost:8080/collab".to_string(),
            start_online: true,
            store: StoreConfig::default(),
            queue: QueueConfig::default(),
            reachability: ReachabilityConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl AppConfig {
    /// In-memory storage and short timers.
    pub fn for_testing() -> Self {
        Self {
            data_dir: None,
            server_url: "ws://127.0.0.1:1/collab".to_string(),
            start_online: true,
            store: StoreConfig::for_testing(),
            queue: QueueConfig::for_testing(),
            reachability: ReachabilityConfig::for_testing(),
            session: SessionConfig::for_testing(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup(ENV_DATA_DIR) {
            config.data_dir = match dir.trim() {
                "" | ":memory:" => None,
                path => Some(PathBuf::from(path)),
            };
        }
        if let Some(url) = lookup(ENV_SERVER_URL) {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(ConfigError::Invalid {
                    var: ENV_SERVER_URL,
                    value: url,
                    reason: "expected a ws:// or wss:// URL".into(),
                });
            }
            config.server_url = url.trim_end_matches('/').to_string();
        }
        if let Some(offline) = lookup(ENV_OFFLINE) {
            config.start_online = !parse_flag(ENV_OFFLINE, &offline)?;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_ANALYSIS_TIMEOUT_SECS)? {
            config.store.analysis_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = parse_var::<u32>(&lookup, ENV_MAX_RETRIES)? {
            if retries == 0 {
                return Err(ConfigError::Invalid {
                    var: ENV_MAX_RETRIES,
                    value: retries.to_string(),
                    reason: "must be at least 1".into(),
                });
            }
            config.queue.max_retries = retries;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_SYNC_INTERVAL_SECS)? {
            config.queue.periodic_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_SETTLE_MS)? {
            config.reachability.settle = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_CONNECT_DELAY_MS)? {
            config.session.connect_delay = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    raw.trim().parse().map(Some).map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: raw.clone(),
        reason: e.to_string(),
    })
}

fn parse_flag(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: raw.to_string(),
            reason: "expected true or false".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults_without_overrides() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.data_dir, Some(PathBuf::from("flowdoc_data")));
        assert!(config.start_online);
        assert_eq!(config.queue.periodic_interval, Duration::from_secs(300));
        assert_eq!(config.reachability.settle, Duration::from_millis(1500));
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            (ENV_DATA_DIR, ":memory:"),
            (ENV_SERVER_URL, "wss://sync.example.com/collab/"),
            (ENV_OFFLINE, "yes"),
            (ENV_ANALYSIS_TIMEOUT_SECS, "5"),
            (ENV_SETTLE_MS, "200"),
        ]))
        .unwrap();

        assert_eq!(config.data_dir, None);
        assert_eq!(config.server_url, "wss://sync.example.com/collab");
        assert!(!config.start_online);
        assert_eq!(config.store.analysis_timeout, Duration::from_secs(5));
        assert_eq!(config.reachability.settle, Duration::from_millis(200));
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let err = AppConfig::from_lookup(lookup(&[(ENV_SETTLE_MS, "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var, .. } if var == ENV_SETTLE_MS));

        let err = AppConfig::from_lookup(lookup(&[(ENV_SERVER_URL, "http://x")])).unwrap_err();
        assert!(err.to_string().contains(ENV_SERVER_URL));

        assert!(AppConfig::from_lookup(lookup(&[(ENV_MAX_RETRIES, "0")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[(ENV_OFFLINE, "maybe")])).is_err());
    }
}
