//! Compact block processor
//!
//! Sequences the pipeline stages of one sync cycle:
//! Download → Validate → Scan → Enhance → Resubmit → Fetch UTXOs.
//!
//! The processor owns every stage, the sync markers and the shared progress
//! caches. A broken chain found by validation is handled in-cycle by rewinding
//! below the error height and running the cycle again; every other stage
//! failure ends the cycle in [`ProcessorState::Error`].

use crate::cancel::CancelToken;
use crate::config::ProcessorConfig;
use crate::downloader::Downloader;
use crate::engine::CryptoEngine;
use crate::enhancer::Enhancer;
use crate::error::SyncFailure;
use crate::latest_blocks::LatestBlocksDataProvider;
use crate::markers::SyncMarkers;
use crate::metrics::{BlockProgress, MetricOperation, SdkMetrics};
use crate::model::{BlockHeight, CompactBlockRange, TransactionOverview, UtxoFetchResult};
use crate::progress::{ProcessorState, SyncEvent, SyncProgress, SyncStage};
use crate::repository::{CompactBlockRepository, TransactionRepository};
use crate::resubmission::TxResubmitter;
use crate::scanner::Scanner;
use crate::source::{BlockSource, ServiceMode};
use crate::utxo::UtxoFetcher;
use crate::validator::Validator;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Capacity of the event channel. Slow subscribers lag instead of blocking.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Outcome of a successful cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Last scanned height after the cycle
    pub scanned_height: Option<BlockHeight>,
    /// Chain tip the cycle synced towards
    pub tip: BlockHeight,
    /// Blocks downloaded by the cycle
    pub downloaded: u64,
    /// Transactions enhanced by the cycle
    pub enhanced: Vec<TransactionOverview>,
    /// Unmined sent transactions the server accepted again
    pub resubmitted: usize,
    /// UTXO fetch result, if the fetch was due
    pub utxos: Option<UtxoFetchResult>,
}

/// Lowest height to rewind to after chain validation failed at
/// `error_height`.
///
/// The distance grows with every consecutive failure and is capped at
/// `max_reorg_size`; the result never drops below
/// `birthday - max_reorg_size`.
pub fn determine_lower_bound(
    error_height: BlockHeight,
    consecutive_errors: u32,
    birthday: BlockHeight,
    rewind_distance: BlockHeight,
    max_reorg_size: BlockHeight,
) -> BlockHeight {
    let offset = max_reorg_size.min(
        rewind_distance.saturating_mul(u64::from(consecutive_errors).saturating_add(1)),
    );
    error_height
        .saturating_sub(offset)
        .max(birthday.saturating_sub(max_reorg_size))
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Sync pipeline state machine.
pub struct CompactBlockProcessor {
    config: ProcessorConfig,
    mode: ServiceMode,
    source: Arc<dyn BlockSource>,
    blocks: Arc<dyn CompactBlockRepository>,
    transactions: Arc<dyn TransactionRepository>,
    engine: Arc<dyn CryptoEngine>,

    downloader: Downloader,
    validator: Validator,
    scanner: Scanner,
    enhancer: Enhancer,
    resubmitter: TxResubmitter,
    utxo_fetcher: UtxoFetcher,

    markers: SyncMarkers,
    latest_blocks: LatestBlocksDataProvider,
    metrics: SdkMetrics,
    progress: SyncProgress,

    state: RwLock<ProcessorState>,
    stage: Mutex<Option<SyncStage>>,
    events: broadcast::Sender<SyncEvent>,
    running: AtomicBool,
    consecutive_chain_errors: AtomicU32,
}

impl CompactBlockProcessor {
    /// Build a processor over the given collaborators.
    ///
    /// Validates `config` and creates the block cache storage.
    pub async fn new(
        config: ProcessorConfig,
        source: Arc<dyn BlockSource>,
        blocks: Arc<dyn CompactBlockRepository>,
        transactions: Arc<dyn TransactionRepository>,
        engine: Arc<dyn CryptoEngine>,
    ) -> Result<Self> {
        config.validate()?;
        blocks.create().await?;

        let mode = config.service_mode.clone();
        let markers = SyncMarkers::new();
        let latest_blocks = LatestBlocksDataProvider::new(config.wallet_birthday);
        let metrics = SdkMetrics::new();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            "Creating compact block processor (birthday {}, mode {:?})",
            config.wallet_birthday, mode
        );

        Ok(Self {
            downloader: Downloader::new(
                Arc::clone(&source),
                Arc::clone(&blocks),
                markers.clone(),
                mode.clone(),
            ),
            validator: Validator::new(Arc::clone(&engine), metrics.clone()),
            scanner: Scanner::new(
                Arc::clone(&engine),
                Arc::clone(&transactions),
                latest_blocks.clone(),
                metrics.clone(),
                config.clone(),
            ),
            enhancer: Enhancer::new(
                Arc::clone(&source),
                Arc::clone(&engine),
                Arc::clone(&transactions),
                markers.clone(),
                metrics.clone(),
                mode.clone(),
            ),
            resubmitter: TxResubmitter::new(
                Arc::clone(&source),
                Arc::clone(&transactions),
                mode.clone(),
                config.resubmission_interval(),
            ),
            utxo_fetcher: UtxoFetcher::new(
                Arc::clone(&source),
                Arc::clone(&engine),
                metrics.clone(),
                mode.clone(),
            ),
            config,
            mode,
            source,
            blocks,
            transactions,
            engine,
            markers,
            latest_blocks,
            metrics,
            progress: SyncProgress::new(),
            state: RwLock::new(ProcessorState::Stopped),
            stage: Mutex::new(None),
            events,
            running: AtomicBool::new(false),
            consecutive_chain_errors: AtomicU32::new(0),
        })
    }

    /// Run one full sync cycle.
    ///
    /// Chain-invalid failures are handled by rewinding and re-running the
    /// cycle, up to `config.retries` consecutive times. Cancellation returns
    /// [`Error::Cancelled`] and leaves the processor `Stopped`; any other
    /// failure returns [`Error::Sync`] and leaves it in `Error`.
    pub async fn run_cycle(&self, cancel: &CancelToken) -> Result<CycleReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::SyncInProgress);
        }
        let _guard = RunningGuard(&self.running);
        let started = Utc::now();
        self.metrics.cbp_start();

        loop {
            match self.cycle_once(cancel, started).await {
                Ok(report) => {
                    self.consecutive_chain_errors.store(0, Ordering::SeqCst);
                    return Ok(report);
                }
                Err(Error::Cancelled) => {
                    self.metrics.action_stop();
                    *self.stage.lock() = None;
                    self.set_state(ProcessorState::Stopped);
                    info!(event = "cycle_cancelled", "Sync cycle cancelled");
                    return Err(Error::Cancelled);
                }
                Err(Error::ChainInvalid { height }) => {
                    let previous = self.consecutive_chain_errors.fetch_add(1, Ordering::SeqCst);
                    if previous >= self.config.retries {
                        return Err(self.fail(Error::ChainInvalid { height }));
                    }
                    if let Err(e) = self.handle_chain_invalid(height, previous).await {
                        return Err(self.fail(e));
                    }
                }
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    async fn cycle_once(&self, cancel: &CancelToken, started: DateTime<Utc>) -> Result<CycleReport> {
        cancel.check()?;
        *self.stage.lock() = None;

        let tip = self.source.latest_height(&self.mode).await?;
        self.latest_blocks.update_latest_block_height(tip);
        self.latest_blocks
            .update_scanned_data(self.transactions.as_ref())
            .await?;

        let birthday = self.config.wallet_birthday;
        let last_scanned = self.latest_blocks.latest_scanned_height();
        let last_downloaded = self
            .markers
            .latest_downloaded_height()
            .max(self.downloader.last_downloaded_height().await?);

        let scan_lower = last_scanned.map_or(birthday, |h| h + 1).max(birthday);
        self.progress.start(scan_lower.saturating_sub(1), tip);
        debug!(
            "Cycle ranges: tip {}, last scanned {:?}, last downloaded {:?}",
            tip, last_scanned, last_downloaded
        );

        let mut report = CycleReport {
            scanned_height: last_scanned,
            tip,
            ..Default::default()
        };

        // Download
        let floor = [last_downloaded, last_scanned, Some(birthday.saturating_sub(1))]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(0);
        if let Some(range) = CompactBlockRange::checked(floor + 1, tip) {
            self.set_stage(SyncStage::Downloading);
            for batch in range.batches(self.config.download_batch_size) {
                let batch_started = Utc::now();
                self.downloader.download_range(batch, cancel).await?;
                self.metrics.push_progress_report(
                    BlockProgress::in_range(range, batch.upper()),
                    batch_started,
                    Utc::now(),
                    batch.count(),
                    MetricOperation::DownloadBlocks,
                );
                report.downloaded += batch.count();
                self.emit(SyncEvent::Downloaded {
                    height: batch.upper(),
                    range,
                });
            }
            info!("Downloaded {} blocks ({})", report.downloaded, range);
        }

        // Validate
        if report.downloaded > 0 {
            self.set_stage(SyncStage::Validating);
            let limit = u32::try_from(report.downloaded).unwrap_or(u32::MAX);
            self.validator.validate(limit, cancel).await?;
        }

        // Scan. Blocks cached by an earlier run count as downloaded.
        let downloaded_top = self.markers.latest_downloaded_height().max(last_downloaded);
        let scan_range = CompactBlockRange::checked(scan_lower, tip)
            .and_then(|range| downloaded_top.and_then(|top| range.clamp_upper(top)));
        if let Some(range) = scan_range {
            self.set_stage(SyncStage::Scanning);
            let events = &self.events;
            let progress = &self.progress;
            let scanned = self
                .scanner
                .scan_blocks(range, range, cancel, |height| {
                    progress.set_current(height);
                    let done = height.saturating_sub(range.lower()) + 1;
                    let _ = events.send(SyncEvent::Scanned {
                        height,
                        progress: (done as f32 / range.count() as f32).min(1.0),
                    });
                })
                .await?;
            report.scanned_height = scanned.or(last_scanned);
            info!("Scanned up to {:?} ({})", report.scanned_height, range);
        } else {
            debug!("Nothing to scan below tip {}", tip);
        }

        // Enhance
        if let Some(scanned) = report.scanned_height {
            let enhance_lower = self
                .markers
                .latest_enhanced_height()
                .map_or(birthday, |h| h + 1)
                .max(birthday);
            if let Some(range) = CompactBlockRange::checked(enhance_lower, scanned) {
                self.set_stage(SyncStage::Enhancing);
                let events = &self.events;
                let enhanced = self
                    .enhancer
                    .enhance(range, cancel, |progress| {
                        let _ = events.send(SyncEvent::Enhanced(progress));
                    })
                    .await?;
                if !enhanced.is_empty() {
                    self.emit(SyncEvent::FoundTransactions {
                        transactions: enhanced.clone(),
                        range,
                    });
                }
                report.enhanced = enhanced;
            }
        }
        cancel.check()?;

        // Resubmit unmined sent transactions
        report.resubmitted = self.resubmitter.resubmit(tip, cancel).await;
        cancel.check()?;

        // Fetch UTXOs
        let utxos_due = self
            .markers
            .latest_utxo_fetched_height()
            .map_or(true, |h| h < tip);
        if utxos_due {
            cancel.check()?;
            if let Some(range) = CompactBlockRange::checked(birthday, tip) {
                self.set_stage(SyncStage::FetchingUtxos);
                let events = &self.events;
                let result = self
                    .utxo_fetcher
                    .fetch(range, cancel, |progress| {
                        let _ = events.send(SyncEvent::UtxosFetched { progress });
                    })
                    .await?;
                cancel.check()?;
                self.markers.set_utxo_fetched(tip);
                report.utxos = Some(result);
            }
        }

        // Finish
        cancel.check()?;
        if let Some(scanned) = report.scanned_height {
            self.blocks.clear_up_to(scanned).await?;
        }
        self.metrics.action_stop();
        *self.stage.lock() = None;
        info!("{}", self.metrics.cbp_overview());
        self.metrics.push_sync_report(started, Utc::now());
        self.progress.complete();
        self.set_state(ProcessorState::Synced);

        info!(
            event = "cycle_finished",
            height = ?report.scanned_height,
            tip = tip,
            downloaded = report.downloaded,
            enhanced = report.enhanced.len(),
            "Sync cycle finished"
        );
        self.emit(SyncEvent::Finished {
            height: report.scanned_height,
        });
        Ok(report)
    }

    async fn handle_chain_invalid(&self, error_height: BlockHeight, consecutive_errors: u32) -> Result<()> {
        let rewind_height = determine_lower_bound(
            error_height,
            consecutive_errors,
            self.config.wallet_birthday,
            self.config.rewind_distance,
            self.config.max_reorg_size,
        );
        warn!(
            event = "chain_reorg",
            error_height = error_height,
            rewind_height = rewind_height,
            consecutive_errors = consecutive_errors + 1,
            "Invalid chain detected; rewinding"
        );

        self.rewind_components(rewind_height).await?;
        self.metrics.action_detail(
            SyncStage::Validating,
            format!("rewound to {} after error at {}", rewind_height, error_height),
        );
        self.emit(SyncEvent::ChainReorg {
            error_height,
            rewind_height,
        });
        Ok(())
    }

    async fn rewind_components(&self, height: BlockHeight) -> Result<()> {
        self.engine.rewind_to_height(height).await?;
        self.downloader.rewind(height + 1).await?;
        self.markers.rewind_to(height);
        self.latest_blocks.rewind_scanned(height);
        Ok(())
    }

    fn fail(&self, error: Error) -> Error {
        let stage = self.stage.lock().take().unwrap_or(SyncStage::Downloading);
        let failure = SyncFailure::from_error(stage, &error);
        error!(
            event = "cycle_failed",
            stage = stage.name(),
            reason = ?failure.reason,
            error = %error,
            "Sync cycle failed"
        );
        self.metrics.action_stop();
        self.set_state(ProcessorState::Error);
        self.emit(SyncEvent::Failed(failure.clone()));
        Error::Sync(failure)
    }

    fn set_stage(&self, stage: SyncStage) {
        *self.stage.lock() = Some(stage);
        self.metrics.action_start(stage);
        self.progress.set_stage(stage);
        debug!(event = "stage_started", stage = stage.name());
        self.set_state(ProcessorState::Syncing(stage));
    }

    fn set_state(&self, state: ProcessorState) {
        *self.state.write() = state;
        self.emit(SyncEvent::StateChanged(state));
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Rewind the wallet, the block cache and the markers to `height`.
    ///
    /// Refused with [`Error::SyncInProgress`] while a cycle runs.
    pub async fn rewind(&self, height: BlockHeight) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::SyncInProgress);
        }
        let _guard = RunningGuard(&self.running);
        info!("Rewinding to height {}", height);
        self.rewind_components(height).await
    }

    /// Clear the block cache and every marker.
    pub async fn wipe(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::SyncInProgress);
        }
        let _guard = RunningGuard(&self.running);
        self.blocks.clear().await?;
        self.markers.reset();
        self.consecutive_chain_errors.store(0, Ordering::SeqCst);
        self.set_state(ProcessorState::Stopped);
        info!("Block cache wiped");
        Ok(())
    }

    /// Query the chain tip and record it.
    pub async fn latest_height(&self) -> Result<BlockHeight> {
        self.latest_blocks
            .update_block_height(self.source.as_ref(), &self.mode)
            .await
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Current state
    pub fn state(&self) -> ProcessorState {
        *self.state.read()
    }

    /// Whether a cycle (or rewind/wipe) is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscribe to processor events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Shared scan status
    pub fn latest_blocks(&self) -> &LatestBlocksDataProvider {
        &self.latest_blocks
    }

    /// Cycle metrics
    pub fn metrics(&self) -> &SdkMetrics {
        &self.metrics
    }

    /// Progress of the running cycle
    pub fn progress(&self) -> &SyncProgress {
        &self.progress
    }

    /// Download, enhancement and UTXO markers
    pub fn markers(&self) -> &SyncMarkers {
        &self.markers
    }

    /// Configuration in use
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_lower_bound_grows_with_consecutive_errors() {
        assert_eq!(determine_lower_bound(1_000, 0, 1, 10, 100), 990);
        assert_eq!(determine_lower_bound(1_000, 1, 1, 10, 100), 980);
        assert_eq!(determine_lower_bound(1_000, 4, 1, 10, 100), 950);
        assert_eq!(determine_lower_bound(1_000, 50, 1, 10, 100), 900);
    }

    #[test]
    fn test_lower_bound_respects_birthday() {
        assert_eq!(determine_lower_bound(505, 3, 500, 10, 100), 465);
        assert_eq!(determine_lower_bound(250, 9, 300, 10, 100), 200);
        assert_eq!(determine_lower_bound(5, 0, 1, 10, 100), 0);
    }

    proptest! {
        #[test]
        fn prop_lower_bound_within_reorg_window(
            error_height in 0u64..5_000_000,
            consecutive in 0u32..1_000,
            birthday in 0u64..5_000_000,
            rewind_distance in 1u64..1_000,
            max_reorg in 1u64..10_000,
        ) {
            let bound = determine_lower_bound(error_height, consecutive, birthday, rewind_distance, max_reorg);
            prop_assert!(bound >= error_height.saturating_sub(max_reorg));
            prop_assert!(bound >= birthday.saturating_sub(max_reorg));
            if error_height >= birthday {
                prop_assert!(bound <= error_height);
            }
        }
    }
}
