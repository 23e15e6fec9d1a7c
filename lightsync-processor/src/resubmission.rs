//! Re-broadcast of sent transactions that never got mined.
//!
//! Runs once per cycle after enhancement. Submissions are throttled and
//! never fail the cycle: a lost broadcast is retried on a later cycle.

use crate::cancel::CancelToken;
use crate::model::BlockHeight;
use crate::repository::TransactionRepository;
use crate::source::{BlockSource, ServiceMode};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Re-submits unmined sent transactions through the block source.
pub struct TxResubmitter {
    source: Arc<dyn BlockSource>,
    transactions: Arc<dyn TransactionRepository>,
    mode: ServiceMode,
    interval: Duration,
    last_resolved: Mutex<Option<Instant>>,
}

impl TxResubmitter {
    /// Resubmitter allowing one round per `interval`.
    pub fn new(
        source: Arc<dyn BlockSource>,
        transactions: Arc<dyn TransactionRepository>,
        mode: ServiceMode,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            transactions,
            mode,
            interval,
            last_resolved: Mutex::new(None),
        }
    }

    /// Submit every candidate up to `tip` if the last round is older than
    /// the interval.
    ///
    /// Returns the number of transactions the server accepted. A round with
    /// no candidates restarts the interval, so a freshly broadcast
    /// transaction is not sent again right away.
    pub async fn resubmit(&self, tip: BlockHeight, cancel: &CancelToken) -> usize {
        let candidates = match self.transactions.find_for_resubmission(tip).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Failed to find resubmission candidates: {}", e);
                return 0;
            }
        };

        let now = Instant::now();
        if candidates.is_empty() {
            *self.last_resolved.lock() = Some(now);
            return 0;
        }

        let due = self
            .last_resolved
            .lock()
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if !due {
            debug!(
                "{} transactions awaiting resubmission; next round not due",
                candidates.len()
            );
            return 0;
        }

        let mut accepted = 0;
        for transaction in &candidates {
            if cancel.is_cancelled() {
                break;
            }
            let Some(raw) = transaction.raw.as_deref() else {
                warn!("Cannot resubmit tx {}: no raw data", transaction.txid_hex());
                break;
            };
            info!("Resubmitting tx {}", transaction.txid_hex());
            match self.source.submit(raw, &self.mode).await {
                Ok(response) if response.is_success() => accepted += 1,
                Ok(response) => {
                    warn!(
                        "Server rejected tx {}: {} ({})",
                        transaction.txid_hex(),
                        response.error_message,
                        response.error_code
                    );
                    break;
                }
                Err(e) => {
                    warn!("Failed to resubmit tx {}: {}", transaction.txid_hex(), e);
                    break;
                }
            }
        }

        *self.last_resolved.lock() = Some(Instant::now());
        accepted
    }
}
