//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "chatrelay.toml",
    "./config/config.toml",
    "./config/chatrelay.toml",
    "/etc/chatrelay/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found), apply environment overrides, validate
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = match self.find_config_file() {
            Some(path) => {
                info!(?path, "Loading configuration from file");
                AppConfig::from_file(&path)?
            }
            None => {
                info!("No configuration file found, using defaults");
                AppConfig::default()
            }
        };

        apply_overrides(&mut config, |key| env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(?path, "Configured path does not exist, searching defaults");
        }

        if let Ok(path) = env::var("CHATRELAY_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn set_parsed<T: FromStr>(target: &mut T, key: &str, value: Option<String>) {
    if let Some(raw) = value {
        match raw.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(key, value = %raw, "Ignoring unparseable override"),
        }
    }
}

/// Apply `CHATRELAY_*` overrides read through `lookup`.
pub(crate) fn apply_overrides<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    // Server
    if let Some(val) = lookup("CHATRELAY_SERVER_HOST") {
        config.server.host = val;
    }
    set_parsed(&mut config.server.port, "CHATRELAY_SERVER_PORT", lookup("CHATRELAY_SERVER_PORT"));
    if let Some(val) = lookup("CHATRELAY_INSTANCE_ID") {
        config.server.instance_id = val;
    }

    // Broker
    if let Some(val) = lookup("CHATRELAY_BROKER_URI") {
        config.broker.uri = val;
    }
    set_parsed(
        &mut config.broker.producer_pool_size,
        "CHATRELAY_PRODUCER_POOL_SIZE",
        lookup("CHATRELAY_PRODUCER_POOL_SIZE"),
    );
    set_parsed(
        &mut config.broker.consumer_pool_size,
        "CHATRELAY_CONSUMER_POOL_SIZE",
        lookup("CHATRELAY_CONSUMER_POOL_SIZE"),
    );
    if let Some(val) = lookup("CHATRELAY_ROOMS") {
        config.broker.rooms = val
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    set_parsed(
        &mut config.broker.consumers_per_room,
        "CHATRELAY_CONSUMERS_PER_ROOM",
        lookup("CHATRELAY_CONSUMERS_PER_ROOM"),
    );

    // Breaker
    set_parsed(&mut config.breaker.enabled, "CHATRELAY_BREAKER_ENABLED", lookup("CHATRELAY_BREAKER_ENABLED"));

    // Database
    if let Some(val) = lookup("CHATRELAY_DATABASE_URL") {
        config.database.url = val;
    }
    set_parsed(
        &mut config.database.max_connections,
        "CHATRELAY_DATABASE_MAX_CONNECTIONS",
        lookup("CHATRELAY_DATABASE_MAX_CONNECTIONS"),
    );

    // Writer
    set_parsed(&mut config.writer.threads, "CHATRELAY_WRITER_THREADS", lookup("CHATRELAY_WRITER_THREADS"));
    set_parsed(
        &mut config.writer.batch_size,
        "CHATRELAY_WRITER_BATCH_SIZE",
        lookup("CHATRELAY_WRITER_BATCH_SIZE"),
    );
    set_parsed(
        &mut config.writer.flush_interval_ms,
        "CHATRELAY_WRITER_FLUSH_INTERVAL_MS",
        lookup("CHATRELAY_WRITER_FLUSH_INTERVAL_MS"),
    );
    set_parsed(
        &mut config.writer.buffer_size,
        "CHATRELAY_WRITER_BUFFER_SIZE",
        lookup("CHATRELAY_WRITER_BUFFER_SIZE"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = AppConfig::default();
        apply_overrides(
            &mut config,
            lookup_from(&[
                ("CHATRELAY_SERVER_PORT", "9090"),
                ("CHATRELAY_ROOMS", "room1, room7 ,"),
                ("CHATRELAY_BREAKER_ENABLED", "true"),
                ("CHATRELAY_DATABASE_URL", "sqlite::memory:"),
            ]),
        );

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.broker.rooms, vec!["room1", "room7"]);
        assert!(config.breaker.enabled);
        assert_eq!(config.database.url, "sqlite::memory:");
    }

    #[test]
    fn test_bad_override_is_ignored() {
        let mut config = AppConfig::default();
        apply_overrides(&mut config, lookup_from(&[("CHATRELAY_WRITER_BATCH_SIZE", "lots")]));
        assert_eq!(config.writer.batch_size, 1000);
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[writer]\nthreads = 2\n").unwrap();

        let config = ConfigLoader::with_path(&path).load().unwrap();
        assert_eq!(config.writer.threads, 2);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[broker]\nconsumer_pool_size = 1\n").unwrap();

        assert!(matches!(
            ConfigLoader::with_path(&path).load(),
            Err(ConfigError::ValidationError(_))
        ));
    }
}
