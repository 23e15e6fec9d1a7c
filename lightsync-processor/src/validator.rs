//! Chain validation stage.

use crate::cancel::CancelToken;
use crate::engine::{ChainValidationError, CryptoEngine};
use crate::metrics::{BlockProgress, MetricOperation, SdkMetrics};
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

/// Checks continuity of freshly cached blocks.
pub struct Validator {
    engine: Arc<dyn CryptoEngine>,
    metrics: SdkMetrics,
}

impl Validator {
    /// Validator over `engine`, sampling into `metrics`.
    pub fn new(engine: Arc<dyn CryptoEngine>, metrics: SdkMetrics) -> Self {
        Self { engine, metrics }
    }

    /// Validate up to `limit` cached blocks.
    ///
    /// A broken chain surfaces as [`Error::ChainInvalid`] carrying the
    /// highest valid height; any other failure as
    /// [`Error::ValidationMachinery`].
    pub async fn validate(&self, limit: u32, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        let started = Utc::now();
        let result = self.engine.validate_chain(limit).await;
        let finished = Utc::now();

        self.metrics.push_progress_report(
            BlockProgress {
                start_height: 0,
                target_height: u64::from(limit),
                progress_height: u64::from(limit),
            },
            started,
            finished,
            u64::from(limit),
            MetricOperation::ValidateBlocks,
        );

        match result {
            Ok(()) => {
                debug!("Validated {} blocks", limit);
                Ok(())
            }
            Err(ChainValidationError::InvalidChain { height }) => {
                warn!("Chain validation found invalid chain above {}", height);
                Err(Error::ChainInvalid { height })
            }
            Err(ChainValidationError::Machinery(reason)) => {
                Err(Error::ValidationMachinery(reason))
            }
        }
    }
}
