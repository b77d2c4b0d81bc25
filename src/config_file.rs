use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// On-disk configuration. Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogkeeperConfigFile {
    pub listen: String,
    pub database: PathBuf,
    pub log_level: String,
    pub watcher: WatcherSection,
    pub collector: CollectorSection,
    pub retention: RetentionSection,
    pub hub: HubSection,
    pub shutdown_grace_secs: u64,
}

impl Default for LogkeeperConfigFile {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            database: PathBuf::from("/data/logkeeper.db"),
            log_level: "info".to_string(),
            watcher: WatcherSection::default(),
            collector: CollectorSection::default(),
            retention: RetentionSection::default(),
            hub: HubSection::default(),
            shutdown_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WatcherSection {
    pub interval_secs: u64,
    pub inspect_timeout_ms: u64,
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            inspect_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CollectorSection {
    pub interval_secs: u64,
    /// Backfill window for containers that were never collected.
    pub lookback_secs: u64,
    pub stop_grace_ms: u64,
}

impl Default for CollectorSection {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            lookback_secs: 3600,
            stop_grace_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetentionSection {
    pub interval_secs: u64,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HubSection {
    /// Outbound messages buffered per viewer before it is dropped.
    pub buffer: usize,
    pub ping_interval_secs: u64,
    pub write_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub backfill_limit: u32,
    pub swap_resync_limit: u32,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            buffer: 256,
            ping_interval_secs: 30,
            write_timeout_secs: 10,
            read_timeout_secs: 60,
            backfill_limit: 100,
            swap_resync_limit: 1000,
        }
    }
}

impl LogkeeperConfigFile {
    fn try_init_from_string(config: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn try_init(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(config) => Self::try_init_from_string(&config),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("watcher.interval_secs", self.watcher.interval_secs),
            ("watcher.inspect_timeout_ms", self.watcher.inspect_timeout_ms),
            ("collector.interval_secs", self.collector.interval_secs),
            ("collector.lookback_secs", self.collector.lookback_secs),
            ("collector.stop_grace_ms", self.collector.stop_grace_ms),
            ("retention.interval_secs", self.retention.interval_secs),
            ("hub.buffer", self.hub.buffer as u64),
            ("hub.ping_interval_secs", self.hub.ping_interval_secs),
            ("hub.write_timeout_secs", self.hub.write_timeout_secs),
            ("hub.read_timeout_secs", self.hub.read_timeout_secs),
            ("hub.backfill_limit", u64::from(self.hub.backfill_limit)),
            ("hub.swap_resync_limit", u64::from(self.hub.swap_resync_limit)),
            ("shutdown_grace_secs", self.shutdown_grace_secs),
        ];
        if let Some((key, _)) = required.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{key} must be greater than zero")));
        }
        if self.hub.read_timeout_secs <= self.hub.ping_interval_secs {
            return Err(ConfigError::Invalid(
                "hub.read_timeout_secs must be longer than hub.ping_interval_secs".to_string(),
            ));
        }
        Ok(())
    }

    pub fn into_config(
        self,
        addr: Option<std::net::SocketAddr>,
        db: Option<PathBuf>,
    ) -> Result<crate::config::LogkeeperConfig, ConfigError> {
        use std::time::Duration;

        let listen = match addr {
            Some(addr) => addr,
            None => self.listen.parse().map_err(|e| {
                ConfigError::Invalid(format!("listen address {:?}: {e}", self.listen))
            })?,
        };

        Ok(crate::config::LogkeeperConfig {
            listen,
            database: db.unwrap_or(self.database),
            log_level: self.log_level,
            watcher_interval: Duration::from_secs(self.watcher.interval_secs),
            inspect_timeout: Duration::from_millis(self.watcher.inspect_timeout_ms),
            collector_interval: Duration::from_secs(self.collector.interval_secs),
            lookback: Duration::from_secs(self.collector.lookback_secs),
            stop_grace: Duration::from_millis(self.collector.stop_grace_ms),
            retention_interval: Duration::from_secs(self.retention.interval_secs),
            hub_buffer: self.hub.buffer,
            ping_interval: Duration::from_secs(self.hub.ping_interval_secs),
            write_timeout: Duration::from_secs(self.hub.write_timeout_secs),
            read_timeout: Duration::from_secs(self.hub.read_timeout_secs),
            backfill_limit: i64::from(self.hub.backfill_limit),
            swap_resync_limit: i64::from(self.hub.swap_resync_limit),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = LogkeeperConfigFile::try_init_from_string("").unwrap();
        assert_eq!(config, LogkeeperConfigFile::default());
        assert_eq!(config.hub.buffer, 256);
        assert_eq!(config.collector.lookback_secs, 3600);
    }

    #[test]
    fn test_partial_sections() {
        let input = r#"
            listen = "127.0.0.1:9000"
            database = "/tmp/logs.db"

            [watcher]
            interval_secs = 5

            [hub]
            backfill_limit = 500
        "#;
        let config = LogkeeperConfigFile::try_init_from_string(input).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.watcher.interval_secs, 5);
        // Keys left out of a section keep their defaults.
        assert_eq!(config.watcher.inspect_timeout_ms, 1000);
        assert_eq!(config.hub.backfill_limit, 500);
        assert_eq!(config.hub.swap_resync_limit, 1000);

        let config = config.into_config(None, None).unwrap();
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.database, PathBuf::from("/tmp/logs.db"));
        assert_eq!(config.watcher_interval, Duration::from_secs(5));
        assert_eq!(config.backfill_limit, 500);
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let input = r#"
            [retention]
            interval_secs = 0
        "#;
        let err = LogkeeperConfigFile::try_init_from_string(input).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("retention.interval_secs")));
    }

    #[test]
    fn test_read_timeout_must_exceed_ping() {
        let input = r#"
            [hub]
            ping_interval_secs = 60
            read_timeout_secs = 30
        "#;
        assert!(matches!(
            LogkeeperConfigFile::try_init_from_string(input),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            LogkeeperConfigFile::try_init_from_string("listen = "),
            Err(ConfigError::Toml(_))
        ));
        assert!(matches!(
            LogkeeperConfigFile::try_init_from_string("[hub]\nbuffer = \"many\""),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn test_missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogkeeperConfigFile::try_init(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, LogkeeperConfigFile::default());
    }

    #[test]
    fn test_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logkeeper.toml");
        std::fs::write(&path, "log_level = \"debug\"\nshutdown_grace_secs = 3\n").unwrap();
        let config = LogkeeperConfigFile::try_init(&path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.shutdown_grace_secs, 3);
    }

    #[test]
    fn test_cli_overrides() {
        let addr: std::net::SocketAddr = "127.0.0.1:1234".parse().unwrap();
        let config = LogkeeperConfigFile::default()
            .into_config(Some(addr), Some(PathBuf::from("override.db")))
            .unwrap();
        assert_eq!(config.listen, addr);
        assert_eq!(config.database, PathBuf::from("override.db"));
    }

    #[test]
    fn test_bad_listen_address() {
        let config = LogkeeperConfigFile {
            listen: "not-an-address".to_string(),
            ..LogkeeperConfigFile::default()
        };
        assert!(matches!(
            config.into_config(None, None),
            Err(ConfigError::Invalid(_))
        ));
    }
}
