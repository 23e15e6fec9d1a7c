//! Block scanning stage.

use crate::cancel::CancelToken;
use crate::config::ProcessorConfig;
use crate::engine::CryptoEngine;
use crate::latest_blocks::LatestBlocksDataProvider;
use crate::metrics::{BlockProgress, MetricOperation, SdkMetrics};
use crate::model::{BlockHeight, CompactBlockRange};
use crate::repository::TransactionRepository;
use crate::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

/// Drives the engine's batched scan over cached blocks.
pub struct Scanner {
    engine: Arc<dyn CryptoEngine>,
    transactions: Arc<dyn TransactionRepository>,
    latest_blocks: LatestBlocksDataProvider,
    metrics: SdkMetrics,
    config: ProcessorConfig,
}

impl Scanner {
    /// Scanner driving `engine` in configured batches.
    pub fn new(
        engine: Arc<dyn CryptoEngine>,
        transactions: Arc<dyn TransactionRepository>,
        latest_blocks: LatestBlocksDataProvider,
        metrics: SdkMetrics,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            engine,
            transactions,
            latest_blocks,
            metrics,
            config,
        }
    }

    /// Scan until `range.upper()` is reached or a batch commits nothing.
    ///
    /// `total_progress_range` is the window metrics samples are keyed to.
    /// Returns the last scanned height.
    pub async fn scan_blocks<F>(
        &self,
        range: CompactBlockRange,
        total_progress_range: CompactBlockRange,
        cancel: &CancelToken,
        mut on_progress: F,
    ) -> Result<Option<BlockHeight>>
    where
        F: FnMut(BlockHeight) + Send,
    {
        cancel.check()?;
        let mut last_scanned = self.transactions.last_scanned_height().await?;

        loop {
            cancel.check()?;
            if last_scanned.is_some_and(|h| h >= range.upper()) {
                break;
            }

            let previous = last_scanned;
            let next_height = previous.map_or(range.lower(), |h| h + 1);
            let batch_size = self.config.scan_batch_size(next_height);

            let started = Utc::now();
            self.engine.scan_blocks(batch_size).await?;
            let finished = Utc::now();

            let block = self.transactions.last_scanned_block().await?;
            last_scanned = block.map(|b| b.height);

            let Some(block) = block.filter(|b| previous.map_or(true, |p| b.height > p)) else {
                debug!("Scan batch at {} committed nothing; scan complete", next_height);
                break;
            };

            on_progress(block.height);
            self.latest_blocks
                .set_latest_scanned(block.height, Some(block.time));
            self.metrics.push_progress_report(
                BlockProgress::in_range(total_progress_range, block.height),
                started,
                finished,
                u64::from(batch_size),
                MetricOperation::ScanBlocks,
            );
            debug!(
                "Scanned {} blocks in {}ms (now at {})",
                block
                    .height
                    .saturating_sub(previous.unwrap_or(next_height.saturating_sub(1))),
                (finished - started).num_milliseconds(),
                block.height
            );

            tokio::task::yield_now().await;
        }

        Ok(last_scanned)
    }
}
