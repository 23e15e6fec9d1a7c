//! Transparent UTXO fetch stage.

use crate::cancel::CancelToken;
use crate::engine::CryptoEngine;
use crate::metrics::{BlockProgress, MetricOperation, SdkMetrics};
use crate::model::{CompactBlockRange, UtxoFetchResult};
use crate::source::{BlockSource, ServiceMode};
use crate::Result;
use chrono::Utc;
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Refreshes unspent transparent outputs of every wallet address.
pub struct UtxoFetcher {
    source: Arc<dyn BlockSource>,
    engine: Arc<dyn CryptoEngine>,
    metrics: SdkMetrics,
    mode: ServiceMode,
}

impl UtxoFetcher {
    /// Fetcher storing outputs through `engine`.
    pub fn new(
        source: Arc<dyn BlockSource>,
        engine: Arc<dyn CryptoEngine>,
        metrics: SdkMetrics,
        mode: ServiceMode,
    ) -> Self {
        Self {
            source,
            engine,
            metrics,
            mode,
        }
    }

    /// Fetch outputs mined in `range` (birthday to tip) and store them.
    ///
    /// `on_progress` receives the processed fraction after every output.
    pub async fn fetch<F>(
        &self,
        range: CompactBlockRange,
        cancel: &CancelToken,
        mut on_progress: F,
    ) -> Result<UtxoFetchResult>
    where
        F: FnMut(f32) + Send,
    {
        let mut addresses = Vec::new();
        for account in self.engine.list_accounts().await? {
            addresses.extend(self.engine.list_transparent_receivers(account).await?);
        }
        if addresses.is_empty() {
            debug!("No transparent receivers; skipping UTXO fetch");
            return Ok(UtxoFetchResult::default());
        }

        cancel.check()?;
        let started = Utc::now();
        let mut stream = self
            .source
            .fetch_utxos(&addresses, range.lower(), &self.mode)
            .await?;
        let mut outputs = Vec::new();
        while let Some(output) = stream.next().await {
            outputs.push(output?);
        }

        let total = outputs.len();
        let mut result = UtxoFetchResult::default();
        for (processed, output) in outputs.into_iter().enumerate() {
            match self.engine.put_unspent_output(&output).await {
                Ok(true) => result.inserted.push(output),
                Ok(false) => result.skipped.push(output),
                Err(e) => {
                    error!("Failed to store UTXO {}:{}: {}", hex::encode(&output.txid), output.index, e);
                    result.skipped.push(output);
                }
            }
            on_progress((processed + 1) as f32 / total as f32);
        }

        self.metrics.push_progress_report(
            BlockProgress::in_range(range, range.upper()),
            started,
            Utc::now(),
            range.count(),
            MetricOperation::FetchUtxos,
        );

        if cancel.is_cancelled() {
            warn!("UTXO fetch on {} cancelled", range);
        }
        debug!(
            "UTXO fetch for {} addresses: {} inserted, {} skipped",
            addresses.len(),
            result.inserted.len(),
            result.skipped.len()
        );
        Ok(result)
    }
}
