//! Server configuration file

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use strata_core::config::{CompactorConfig, RingConfig, StorageConfig};
use strata_core::StrataError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error(transparent)]
    Invalid(#[from] StrataError),
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Directory holding the bucket
    pub bucket_dir: PathBuf,
    /// Default log filter, overridden by `RUST_LOG`
    pub log_level: String,
    pub storage: StorageConfig,
    pub ring: RingConfig,
    /// Present on compactors only; without it the instance never writes
    pub compactor: Option<CompactorConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 3200)),
            bucket_dir: PathBuf::from("data"),
            log_level: "info".to_string(),
            storage: StorageConfig::default(),
            ring: RingConfig::default(),
            compactor: None,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: ServerConfig =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.prepare()?;
        Ok(config)
    }

    /// Fill defaulted values and validate every section
    pub fn prepare(&mut self) -> Result<(), ConfigError> {
        self.storage.apply_defaults();
        self.storage.validate()?;
        if let Some(compactor) = &self.compactor {
            compactor.validate()?;
            self.ring.validate()?;
        }
        Ok(())
    }
}
