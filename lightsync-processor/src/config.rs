//! Processor configuration

use crate::model::BlockHeight;
use crate::source::ServiceMode;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable overriding the poll interval (seconds).
pub const POLL_SECS_ENV: &str = "LIGHTSYNC_POLL_SECS";

/// Environment variable selecting the network ("mainnet" or "testnet").
pub const NETWORK_ENV: &str = "LIGHTSYNC_NETWORK";

/// Height above which mainnet scans use the reduced batch size.
pub const MAINNET_REDUCED_BATCH_HEIGHT: BlockHeight = 1_600_000;

/// Scan batch size used on mainnet above [`MAINNET_REDUCED_BATCH_HEIGHT`].
pub const REDUCED_SCAN_BATCH_SIZE: u32 = 5;

/// Chain network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Main network
    #[default]
    Mainnet,
    /// Test network
    Testnet,
}

impl std::str::FromStr for NetworkType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(Self::Mainnet),
            "testnet" | "test" => Ok(Self::Testnet),
            other => Err(Error::Config(format!("unknown network '{}'", other))),
        }
    }
}

/// Compact block processor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Network the wallet lives on
    pub network: NetworkType,
    /// First height that can contain wallet transactions
    pub wallet_birthday: BlockHeight,
    /// Blocks per atomic download write
    pub download_batch_size: u64,
    /// Blocks per engine scan call
    pub scanning_batch_size: u32,
    /// Failed cycles tolerated before the runner gives up
    pub retries: u32,
    /// Upper bound for the retry backoff, seconds
    pub max_backoff_interval_secs: u64,
    /// Base rewind distance after an invalid chain
    pub rewind_distance: BlockHeight,
    /// Deepest reorg handled
    pub max_reorg_size: BlockHeight,
    /// Base interval between cycles, seconds
    pub block_poll_interval_secs: u64,
    /// Minimum time between resubmissions of unmined sent transactions,
    /// seconds
    pub resubmission_interval_secs: u64,
    /// Transport for every stage
    pub service_mode: ServiceMode,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            network: NetworkType::Mainnet,
            wallet_birthday: 1,
            download_batch_size: 100,
            scanning_batch_size: 100,
            retries: 5,
            max_backoff_interval_secs: 600,
            rewind_distance: 10,
            max_reorg_size: 100,
            block_poll_interval_secs: 20,
            resubmission_interval_secs: 300,
            service_mode: ServiceMode::Direct,
        }
    }
}

impl ProcessorConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `LIGHTSYNC_POLL_SECS` and `LIGHTSYNC_NETWORK` when set.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(value) = std::env::var(POLL_SECS_ENV) {
            if !value.trim().is_empty() {
                let secs: u64 = value.trim().parse().map_err(|_| {
                    Error::Config(format!("{} must be whole seconds, got '{}'", POLL_SECS_ENV, value))
                })?;
                self.block_poll_interval_secs = secs.max(1);
            }
        }
        if let Ok(value) = std::env::var(NETWORK_ENV) {
            if !value.trim().is_empty() {
                self.network = value.parse()?;
            }
        }
        Ok(self)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.download_batch_size == 0 {
            return Err(Error::Config("download_batch_size must be positive".into()));
        }
        if self.scanning_batch_size == 0 {
            return Err(Error::Config("scanning_batch_size must be positive".into()));
        }
        if self.block_poll_interval_secs == 0 {
            return Err(Error::Config("block_poll_interval_secs must be positive".into()));
        }
        Ok(())
    }

    /// Delay between polls of the chain tip
    pub fn block_poll_interval(&self) -> Duration {
        Duration::from_secs(self.block_poll_interval_secs)
    }

    /// Upper bound for the retry backoff
    pub fn max_backoff_interval(&self) -> Duration {
        Duration::from_secs(self.max_backoff_interval_secs)
    }

    /// Minimum time between resubmission rounds
    pub fn resubmission_interval(&self) -> Duration {
        Duration::from_secs(self.resubmission_interval_secs)
    }

    /// Scan batch size for a scan starting at `next_height`.
    pub fn scan_batch_size(&self, next_height: BlockHeight) -> u32 {
        if self.network == NetworkType::Mainnet && next_height > MAINNET_REDUCED_BATCH_HEIGHT {
            REDUCED_SCAN_BATCH_SIZE
        } else {
            self.scanning_batch_size
        }
    }
}
