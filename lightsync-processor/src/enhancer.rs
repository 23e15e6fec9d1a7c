//! Transaction enhancement stage.
//!
//! Scanning only yields compact transaction data. Enhancement fetches the
//! full transaction for every wallet transaction still lacking it and hands
//! it to the engine so memos and outgoing data can be decrypted.

use crate::cancel::CancelToken;
use crate::engine::CryptoEngine;
use crate::markers::SyncMarkers;
use crate::metrics::{BlockProgress, MetricOperation, SdkMetrics};
use crate::model::{
    CompactBlockRange, EnhancementProgress, TransactionKind, TransactionOverview,
    TransactionStatus,
};
use crate::repository::TransactionRepository;
use crate::source::{BlockSource, ServiceMode};
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Attempts per transaction before enhancement gives up.
pub const MAX_ENHANCE_ATTEMPTS: u32 = 5;

/// Fetches and decrypts full transactions.
pub struct Enhancer {
    source: Arc<dyn BlockSource>,
    engine: Arc<dyn CryptoEngine>,
    transactions: Arc<dyn TransactionRepository>,
    markers: SyncMarkers,
    metrics: SdkMetrics,
    mode: ServiceMode,
}

impl Enhancer {
    /// Enhancer fetching from `source` and decrypting with `engine`.
    pub fn new(
        source: Arc<dyn BlockSource>,
        engine: Arc<dyn CryptoEngine>,
        transactions: Arc<dyn TransactionRepository>,
        markers: SyncMarkers,
        metrics: SdkMetrics,
        mode: ServiceMode,
    ) -> Self {
        Self {
            source,
            engine,
            transactions,
            markers,
            metrics,
            mode,
        }
    }

    /// Enhance every transaction in `range` lacking full data.
    ///
    /// Returns the enhanced overviews. On cancellation the transactions
    /// enhanced so far are returned instead of an error.
    pub async fn enhance<F>(
        &self,
        range: CompactBlockRange,
        cancel: &CancelToken,
        mut on_progress: F,
    ) -> Result<Vec<TransactionOverview>>
    where
        F: FnMut(EnhancementProgress) + Send,
    {
        cancel.check()?;
        debug!("Started enhancing range {}", range);
        let started = Utc::now();

        let pending: Vec<TransactionOverview> = self
            .transactions
            .find_in_range(range, usize::MAX, TransactionKind::All)
            .await?
            .into_iter()
            .filter(|tx| !tx.is_enhanced())
            .collect();

        if pending.is_empty() {
            self.markers.set_enhanced(range.upper());
            debug!("No transactions to enhance in {}", range);
            return Ok(Vec::new());
        }

        let total = pending.len();
        let mut enhanced: Vec<TransactionOverview> = Vec::with_capacity(total);
        let mut cancelled = false;
        let mut failure = None;

        for transaction in &pending {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            match self.enhance_with_retry(transaction).await {
                Ok(overview) => {
                    if let Some(height) = overview.mined_height {
                        self.markers.advance_enhanced(height);
                    }
                    enhanced.push(overview.clone());
                    on_progress(EnhancementProgress {
                        total_transactions: total,
                        enhanced_transactions: enhanced.len(),
                        last_found_transaction: Some(overview),
                        range,
                    });
                }
                Err(e) => {
                    error!("Error enhancing transactions in {}: {}", range, e);
                    failure = Some(e);
                    break;
                }
            }
        }

        self.metrics.push_progress_report(
            BlockProgress::in_range(range, range.upper()),
            started,
            Utc::now(),
            range.count(),
            MetricOperation::Enhancement,
        );

        if let Some(e) = failure {
            return Err(e);
        }

        if cancelled {
            warn!(
                "Enhancement of {} cancelled after {} of {} transactions",
                range,
                enhanced.len(),
                total
            );
            return Ok(self.requery(enhanced).await);
        }

        self.markers.set_enhanced(range.upper());
        info!("Enhanced {} transactions in {}", enhanced.len(), range);
        Ok(enhanced)
    }

    async fn enhance_with_retry(&self, transaction: &TransactionOverview) -> Result<TransactionOverview> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let reason = match self.enhance_one(transaction).await {
                Ok(overview) => return Ok(overview),
                Err(e) => e,
            };
            warn!(
                "Could not enhance tx {} (attempt {}/{}): {}",
                transaction.txid_hex(),
                attempts,
                MAX_ENHANCE_ATTEMPTS,
                reason
            );
            if attempts >= MAX_ENHANCE_ATTEMPTS {
                return Err(Error::EnhancementExhausted {
                    txid: transaction.txid_hex(),
                    attempts,
                    reason: reason.to_string(),
                });
            }
        }
    }

    async fn enhance_one(&self, transaction: &TransactionOverview) -> Result<TransactionOverview> {
        let (fetched, status) = self
            .source
            .fetch_transaction(&transaction.raw_id, &self.mode)
            .await?;

        let fetched = match (fetched, status) {
            (_, TransactionStatus::TxidNotRecognized) => {
                return Err(Error::NotFound(format!(
                    "transaction {} not recognized by server",
                    transaction.txid_hex()
                )))
            }
            (None, _) => {
                return Err(Error::NotFound(format!(
                    "no raw data for transaction {}",
                    transaction.txid_hex()
                )))
            }
            (Some(fetched), _) => fetched,
        };

        let mined_height = fetched.mined_height.or(transaction.mined_height);
        self.engine
            .decrypt_and_store_transaction(&fetched.raw, mined_height)
            .await?;

        self.transactions
            .find_by_raw_id(&transaction.raw_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "transaction {} missing after decryption",
                    transaction.txid_hex()
                ))
            })
    }

    async fn requery(&self, enhanced: Vec<TransactionOverview>) -> Vec<TransactionOverview> {
        let mut out = Vec::with_capacity(enhanced.len());
        for overview in enhanced {
            match self.transactions.find_by_raw_id(&overview.raw_id).await {
                Ok(Some(fresh)) => out.push(fresh),
                _ => out.push(overview),
            }
        }
        out
    }
}
