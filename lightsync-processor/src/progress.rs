//! Sync progress tracking with ETA calculation, processor states and events

use crate::error::SyncFailure;
use crate::model::{BlockHeight, CompactBlockRange, EnhancementProgress, TransactionOverview};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStage {
    /// Fetching compact blocks
    Downloading,
    /// Checking cached chain continuity
    Validating,
    /// Trial-decrypting cached blocks
    Scanning,
    /// Fetching full transactions
    Enhancing,
    /// Fetching transparent outputs
    FetchingUtxos,
}

impl SyncStage {
    /// Stages in execution order
    pub const ALL: [SyncStage; 5] = [
        SyncStage::Downloading,
        SyncStage::Validating,
        SyncStage::Scanning,
        SyncStage::Enhancing,
        SyncStage::FetchingUtxos,
    ];

    /// Get display name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Downloading => "Downloading",
            Self::Validating => "Validating",
            Self::Scanning => "Scanning",
            Self::Enhancing => "Enhancing",
            Self::FetchingUtxos => "Fetching UTXOs",
        }
    }
}

/// Processor state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessorState {
    /// Not running
    Stopped,
    /// Running the given stage
    Syncing(SyncStage),
    /// Caught up with the chain tip
    Synced,
    /// Last cycle failed
    Error,
}

impl ProcessorState {
    /// Whether a cycle is in flight
    pub fn is_syncing(&self) -> bool {
        matches!(self, Self::Syncing(_))
    }
}

/// Notification published by the processor.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// State transition
    StateChanged(ProcessorState),
    /// A download sub-batch was stored
    Downloaded {
        /// Highest stored height
        height: BlockHeight,
        /// Range of the current cycle
        range: CompactBlockRange,
    },
    /// Scan advanced
    Scanned {
        /// Last scanned height
        height: BlockHeight,
        /// Fraction of the cycle's scan range, 0..=1
        progress: f32,
    },
    /// One transaction enhanced
    Enhanced(EnhancementProgress),
    /// UTXO fetch advanced
    UtxosFetched {
        /// Fraction processed, 0..=1
        progress: f32,
    },
    /// Transactions enhanced by this cycle
    FoundTransactions {
        /// Enhanced transactions
        transactions: Vec<TransactionOverview>,
        /// Range they were found in
        range: CompactBlockRange,
    },
    /// Chain reorganization handled by rewinding
    ChainReorg {
        /// Height reported invalid
        error_height: BlockHeight,
        /// Height rewound to
        rewind_height: BlockHeight,
    },
    /// Cycle finished
    Finished {
        /// Last scanned height, if anything was scanned
        height: Option<BlockHeight>,
    },
    /// Cycle failed
    Failed(SyncFailure),
}

/// Sync progress
#[derive(Debug, Clone)]
pub struct SyncProgress {
    inner: Arc<RwLock<ProgressInner>>,
}

#[derive(Debug, Clone)]
struct ProgressInner {
    current_height: u64,
    target_height: u64,
    start_height: u64,
    stage: Option<SyncStage>,
    start_time: Option<Instant>,
    eta_seconds: Option<u64>,
    blocks_per_second: f64,
    complete: bool,
}

impl SyncProgress {
    /// Create new progress tracker
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ProgressInner {
                current_height: 0,
                target_height: 0,
                start_height: 0,
                stage: None,
                start_time: None,
                eta_seconds: None,
                blocks_per_second: 0.0,
                complete: false,
            })),
        }
    }

    /// Start tracking from `start` towards `target`.
    pub fn start(&self, start: u64, target: u64) {
        let mut inner = self.inner.write();
        inner.start_time = Some(Instant::now());
        inner.start_height = start;
        inner.current_height = start;
        inner.target_height = target;
        inner.eta_seconds = None;
        inner.blocks_per_second = 0.0;
        inner.complete = false;
    }

    /// Update current height and recompute the rate.
    pub fn set_current(&self, height: u64) {
        let mut inner = self.inner.write();
        inner.current_height = height;

        let Some(start_time) = inner.start_time else {
            return;
        };
        let elapsed = start_time.elapsed().as_secs_f64();
        let blocks_synced = inner.current_height.saturating_sub(inner.start_height);
        let blocks_remaining = inner.target_height.saturating_sub(inner.current_height);

        if blocks_synced > 0 && elapsed > 0.0 {
            inner.blocks_per_second = blocks_synced as f64 / elapsed;
            inner.eta_seconds = Some((blocks_remaining as f64 / inner.blocks_per_second) as u64);
        }
    }

    /// Set stage
    pub fn set_stage(&self, stage: SyncStage) {
        self.inner.write().stage = Some(stage);
    }

    /// Get progress percentage
    pub fn percentage(&self) -> f64 {
        let inner = self.inner.read();
        if inner.complete || inner.current_height >= inner.target_height {
            return 100.0;
        }
        if inner.target_height <= inner.start_height {
            return 0.0;
        }

        let total = inner.target_height - inner.start_height;
        let done = inner.current_height.saturating_sub(inner.start_height);

        (done as f64 / total as f64) * 100.0
    }

    /// Get current height
    pub fn current_height(&self) -> u64 {
        self.inner.read().current_height
    }

    /// Get target height
    pub fn target_height(&self) -> u64 {
        self.inner.read().target_height
    }

    /// Get current stage
    pub fn stage(&self) -> Option<SyncStage> {
        self.inner.read().stage
    }

    /// Get ETA in seconds
    pub fn eta_seconds(&self) -> Option<u64> {
        self.inner.read().eta_seconds
    }

    /// Get blocks per second
    pub fn blocks_per_second(&self) -> f64 {
        self.inner.read().blocks_per_second
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Option<Duration> {
        self.inner.read().start_time.map(|start| start.elapsed())
    }

    /// Mark as complete
    pub fn complete(&self) {
        let mut inner = self.inner.write();
        inner.complete = true;
        inner.stage = None;
        inner.current_height = inner.target_height;
        inner.eta_seconds = Some(0);
    }

    /// Check if complete
    pub fn is_complete(&self) -> bool {
        self.inner.read().complete
    }

    /// Get summary string
    pub fn summary(&self) -> String {
        let stage = self.stage().map(|s| s.name()).unwrap_or("Synced");
        let percentage = self.percentage();
        let inner = self.inner.read();

        let eta_str = match inner.eta_seconds {
            Some(secs) if secs > 0 => format!("ETA: {}m {}s", secs / 60, secs % 60),
            _ => "ETA: calculating...".to_string(),
        };

        format!(
            "{} | {}/{} ({:.1}%) | {:.1} blocks/s | {}",
            stage,
            inner.current_height,
            inner.target_height,
            percentage,
            inner.blocks_per_second,
            eta_str
        )
    }
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(SyncStage::Downloading.name(), "Downloading");
        assert_eq!(SyncStage::Validating.name(), "Validating");
        assert_eq!(SyncStage::Scanning.name(), "Scanning");
        assert_eq!(SyncStage::Enhancing.name(), "Enhancing");
        assert_eq!(SyncStage::FetchingUtxos.name(), "Fetching UTXOs");
    }

    #[test]
    fn test_progress_percentage() {
        let progress = SyncProgress::new();
        progress.start(100, 200);
        assert_eq!(progress.percentage(), 0.0);

        progress.set_current(150);
        assert!((progress.percentage() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_completion() {
        let progress = SyncProgress::new();
        progress.start(0, 100);
        progress.set_stage(SyncStage::Scanning);
        assert!(!progress.is_complete());

        progress.complete();
        assert!(progress.is_complete());
        assert_eq!(progress.stage(), None);
        assert_eq!(progress.current_height(), 100);
    }

    #[test]
    fn test_summary_string() {
        let progress = SyncProgress::new();
        progress.start(0, 1000);
        progress.set_stage(SyncStage::Downloading);
        progress.set_current(500);

        let summary = progress.summary();
        assert!(summary.starts_with("Downloading"));
        assert!(summary.contains("500/1000"));
    }

    #[test]
    fn test_state_is_syncing() {
        assert!(ProcessorState::Syncing(SyncStage::Enhancing).is_syncing());
        assert!(!ProcessorState::Synced.is_syncing());
    }
}
