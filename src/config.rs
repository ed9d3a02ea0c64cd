//! Configuration

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use witnet_reputation::LedgerParams;

use crate::settlement::LOOKBACK_MARGIN;

/// Errors raised while loading the configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config file `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config file `{}`: {source}", path.display())]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid reputation parameters: {0}")]
    InvalidParams(String),
}

/// Configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Source of settled data requests
    #[serde(default)]
    pub settlements: Settlements,
    /// Durable sink
    #[serde(default)]
    pub storage: Storage,
    /// Fast-restart file snapshot
    #[serde(default)]
    pub snapshot: Snapshot,
    /// Epoch range of the batch run
    #[serde(default)]
    pub driver: Driver,
    /// Constants of the reputation engine
    #[serde(default)]
    pub reputation: Reputation,
}

/// Source of settled data requests
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settlements {
    /// JSON file with the settled data requests
    #[serde(default = "default_settlements_path")]
    pub path: PathBuf,
    /// Epochs scanned before the start of every window
    #[serde(default = "default_lookback_margin")]
    pub lookback_margin: u64,
}

impl Default for Settlements {
    fn default() -> Self {
        Self {
            path: default_settlements_path(),
            lookback_margin: default_lookback_margin(),
        }
    }
}

fn default_settlements_path() -> PathBuf {
    "settlements.json".into()
}

fn default_lookback_margin() -> u64 {
    LOOKBACK_MARGIN
}

/// Storage backend of the durable sink
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageBackend {
    /// Volatile, only useful for dry runs
    #[default]
    InMemory,
    /// RocksDB database in `db_path`
    RocksDB,
}

/// Storage
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Storage {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Path to the directory that will contain the database. Used only if backend is RocksDB.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    ".witnet_explorer/storage".into()
}

/// Fast-restart file snapshot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Snapshot {
    #[serde(default = "default_snapshot_path")]
    pub path: PathBuf,
    /// Start from the snapshot instead of an empty ledger
    #[serde(default)]
    pub load: bool,
    /// Save the snapshot at the end of the run
    #[serde(default)]
    pub persist: bool,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            path: default_snapshot_path(),
            load: false,
            persist: false,
        }
    }
}

fn default_snapshot_path() -> PathBuf {
    "reputation_snapshot.json".into()
}

/// Epoch range of the batch run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Driver {
    /// First epoch processed by a cold ledger
    #[serde(default)]
    pub start_epoch: u64,
    /// Last epoch to process. If missing, process up to the last settled data request.
    #[serde(default)]
    pub stop_epoch: Option<u64>,
    /// Number of epochs read from the settlement reader at once
    #[serde(default = "default_batch_epochs")]
    pub batch_epochs: u64,
}

impl Default for Driver {
    fn default() -> Self {
        Self {
            start_epoch: 0,
            stop_epoch: None,
            batch_epochs: default_batch_epochs(),
        }
    }
}

fn default_batch_epochs() -> u64 {
    1_000
}

/// Constants of the reputation engine, see `LedgerParams`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Reputation {
    #[serde(default = "default_expire_alpha_diff")]
    pub expire_alpha_diff: u64,
    #[serde(default = "default_issuance_stop")]
    pub issuance_stop: u64,
    #[serde(default = "default_penalization_factor")]
    pub penalization_factor: f64,
    #[serde(default = "default_drift_tolerance")]
    pub drift_tolerance: u64,
}

impl Default for Reputation {
    fn default() -> Self {
        Self {
            expire_alpha_diff: default_expire_alpha_diff(),
            issuance_stop: default_issuance_stop(),
            penalization_factor: default_penalization_factor(),
            drift_tolerance: default_drift_tolerance(),
        }
    }
}

fn default_expire_alpha_diff() -> u64 {
    LedgerParams::default().expire_alpha_diff
}

fn default_issuance_stop() -> u64 {
    LedgerParams::default().issuance_stop
}

fn default_penalization_factor() -> f64 {
    LedgerParams::default().penalization_factor
}

fn default_drift_tolerance() -> u64 {
    LedgerParams::default().drift_tolerance
}

impl Reputation {
    /// Validated ledger parameters
    pub fn to_params(&self) -> Result<LedgerParams, ConfigError> {
        if !(0.0..=1.0).contains(&self.penalization_factor) {
            return Err(ConfigError::InvalidParams(format!(
                "penalization_factor must be in [0, 1], found {}",
                self.penalization_factor
            )));
        }

        Ok(LedgerParams {
            expire_alpha_diff: self.expire_alpha_diff,
            issuance_stop: self.issuance_stop,
            penalization_factor: self.penalization_factor,
            drift_tolerance: self.drift_tolerance,
        })
    }
}

/// Load configuration from a file written in Toml format.
pub fn from_file<S: AsRef<Path>>(file: S) -> Result<Config, ConfigError> {
    let f = file.as_ref();

    log::debug!("Loading config from `{}`", f.to_string_lossy());

    let contents = fs::read_to_string(f).map_err(|source| ConfigError::Io {
        path: f.to_path_buf(),
        source,
    })?;

    toml::from_str(&contents).map_err(|source| ConfigError::Toml {
        path: f.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(
            config.reputation.to_params().unwrap(),
            LedgerParams::default()
        );
    }

    #[test]
    fn partial_sections() {
        let config: Config = toml::from_str(
            r#"
[settlements]
path = "/data/tallies.json"

[storage]
backend = "RocksDB"
db_path = "/data/db"

[driver]
stop_epoch = 2000

[reputation]
expire_alpha_diff = 100
"#,
        )
        .unwrap();

        assert_eq!(config.settlements.path, PathBuf::from("/data/tallies.json"));
        assert_eq!(config.settlements.lookback_margin, 10);
        assert_eq!(config.storage.backend, StorageBackend::RocksDB);
        assert_eq!(config.driver.stop_epoch, Some(2000));
        assert_eq!(config.driver.batch_epochs, 1_000);
        let params = config.reputation.to_params().unwrap();
        assert_eq!(params.expire_alpha_diff, 100);
        assert_eq!(params.issuance_stop, 1 << 20);
    }

    #[test]
    fn sample_config_file() {
        let config: Config = toml::from_str(include_str!("../witnet_explorer.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let res: Result<Config, _> = toml::from_str(
            r#"
[driver]
stop_epoh = 2000
"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn invalid_penalization_factor() {
        let reputation = Reputation {
            penalization_factor: 1.5,
            ..Reputation::default()
        };
        assert!(matches!(
            reputation.to_params(),
            Err(ConfigError::InvalidParams(_))
        ));
    }
}
