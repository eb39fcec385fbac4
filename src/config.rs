//! Layered configuration.
//!
//! Sources, lowest to highest priority:
//! 1. Defaults on the structs
//! 2. TOML file (`config/modelfetch.toml`, or the path in `MODELFETCH_CONFIG`)
//! 3. `.env` and process environment, `MODELFETCH__<SECTION>__<KEY>`
//!
//! e.g. `MODELFETCH__TRANSFER__STALL_TIMEOUT_MS=10000`.

use crate::downloader::TransferConfig;
use crate::manager::ManagerConfig;
use config::{Environment, File};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use thiserror::Error;

const CONFIG_ENV_VAR: &str = "MODELFETCH_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/modelfetch.toml";
const ENV_PREFIX: &str = "MODELFETCH";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transfer: TransferConfig,
    pub manager: ManagerConfig,
    /// SQLite file for job records. Jobs live only in memory when unset.
    pub state_db: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let path = env::var(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from_path(path)
    }

    pub fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if path.exists() {
            tracing::info!(path = %path.display(), "loading configuration file");
            builder = builder.add_source(File::from(path).required(false));
        } else {
            tracing::debug!(path = %path.display(), "no configuration file, using defaults");
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer.stall_timeout_ms == 0 {
            return Err(ConfigError::Invalid("transfer.stall_timeout_ms must be > 0".into()));
        }
        if self.transfer.progress_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "transfer.progress_interval_ms must be > 0".into(),
            ));
        }
        if self.manager.persist_interval_ms == 0 {
            return Err(ConfigError::Invalid("manager.persist_interval_ms must be > 0".into()));
        }
        Ok(())
    }
}
