//! Server configuration read from the environment.

use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::storage::StorageConfig;
use crate::sync::SyncServerConfig;

/// Settings for the whole server process
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub storage_path: String,
    pub presence_timeout: Duration,
    pub save_interval: Duration,
    pub cleanup_interval: Duration,
    pub max_sessions_per_document: usize,
    pub compaction_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let sync = SyncServerConfig::default();
        Self {
            port: 5000,
            storage_path: StorageConfig::default().path,
            presence_timeout: sync.presence_timeout,
            save_interval: sync.save_interval,
            cleanup_interval: sync.cleanup_interval,
            max_sessions_per_document: sync.max_sessions_per_document,
            compaction_enabled: sync.compaction_enabled,
        }
    }
}

impl ServerConfig {
    /// Read configuration from environment variables. Call after
    /// `dotenvy::dotenv()` so `.env` values are visible.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            Duration::from_secs(parse_or(&lookup, key, default.as_secs(), |s| *s > 0))
        };

        Self {
            port: parse_or(&lookup, "PORT", defaults.port, |p| *p > 0),
            storage_path: lookup("STORAGE_PATH")
                .filter(|p| !p.trim().is_empty())
                .unwrap_or(defaults.storage_path),
            presence_timeout: secs("PRESENCE_TIMEOUT_SECS", defaults.presence_timeout),
            save_interval: secs("SAVE_INTERVAL_SECS", defaults.save_interval),
            cleanup_interval: secs("CLEANUP_INTERVAL_SECS", defaults.cleanup_interval),
            max_sessions_per_document: parse_or(
                &lookup,
                "MAX_SESSIONS_PER_DOCUMENT",
                defaults.max_sessions_per_document,
                |n| *n > 0,
            ),
            compaction_enabled: parse_or(
                &lookup,
                "COMPACTION_ENABLED",
                defaults.compaction_enabled,
                |_| true,
            ),
        }
    }

    pub fn sync_config(&self) -> SyncServerConfig {
        SyncServerConfig {
            max_sessions_per_document: self.max_sessions_per_document,
            save_interval: self.save_interval,
            cleanup_interval: self.cleanup_interval,
            presence_timeout: self.presence_timeout,
            compaction_enabled: self.compaction_enabled,
            ..Default::default()
        }
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig::new(&self.storage_path)
    }
}

/// Parse `key`, falling back to `default` when it is unset, unparsable or
/// rejected by `valid`.
fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    valid: fn(&T) -> bool,
) -> T {
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => value,
        _ => {
            warn!("Invalid value {:?} for {}, using default", raw, key);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.port, 5000);
        assert_eq!(config.storage_path, "./data/docsync.sled");
        assert_eq!(config.presence_timeout, Duration::from_secs(30));
        assert_eq!(config.max_sessions_per_document, 50);
        assert!(!config.compaction_enabled);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("PORT", "8080"),
            ("STORAGE_PATH", "/var/lib/docsync"),
            ("SAVE_INTERVAL_SECS", "2"),
            ("COMPACTION_ENABLED", "true"),
        ]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.storage_config().path, "/var/lib/docsync");

        let sync = config.sync_config();
        assert_eq!(sync.save_interval, Duration::from_secs(2));
        assert!(sync.compaction_enabled);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = config_from(&[
            ("PORT", "not-a-port"),
            ("CLEANUP_INTERVAL_SECS", "0"),
            ("MAX_SESSIONS_PER_DOCUMENT", "-3"),
            ("COMPACTION_ENABLED", "yes"),
            ("STORAGE_PATH", "  "),
        ]);
        assert_eq!(config.port, 5000);
        assert_eq!(config.cleanup_interval, Duration::from_secs(15));
        assert_eq!(config.max_sessions_per_document, 50);
        assert!(!config.compaction_enabled);
        assert_eq!(config.storage_path, "./data/docsync.sled");
    }
}
