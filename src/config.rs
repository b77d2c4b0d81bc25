use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::collector::CollectorSettings;
use crate::config_file::{ConfigError, LogkeeperConfigFile};
use crate::hub::ConnectionTiming;
use crate::watcher::WatcherSettings;

/// Resolved runtime configuration: the config file with CLI overrides
/// applied.
#[derive(Debug, Clone)]
pub struct LogkeeperConfig {
    pub listen: SocketAddr,
    pub database: PathBuf,
    pub log_level: String,
    pub watcher_interval: Duration,
    pub inspect_timeout: Duration,
    pub collector_interval: Duration,
    pub lookback: Duration,
    pub stop_grace: Duration,
    pub retention_interval: Duration,
    pub hub_buffer: usize,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
    pub backfill_limit: i64,
    pub swap_resync_limit: i64,
    pub shutdown_grace: Duration,
}

impl LogkeeperConfig {
    pub fn init() -> Result<Self, ConfigError> {
        let args = crate::cli::get_cli_args();
        LogkeeperConfigFile::try_init(&args.config)?.into_config(args.addr, args.db.clone())
    }

    pub fn collector_settings(&self) -> CollectorSettings {
        CollectorSettings {
            lookback: self.lookback,
            stop_grace: self.stop_grace,
        }
    }

    pub fn watcher_settings(&self) -> WatcherSettings {
        WatcherSettings {
            inspect_timeout: self.inspect_timeout,
            swap_resync_limit: self.swap_resync_limit,
        }
    }

    pub fn connection_timing(&self) -> ConnectionTiming {
        ConnectionTiming {
            ping_interval: self.ping_interval,
            write_timeout: self.write_timeout,
            read_timeout: self.read_timeout,
        }
    }
}
