//! Structured logging for sync observability

use crate::model::BlockHeight;
use crate::progress::{SyncEvent, SyncStage};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. Returns `false`
/// if a subscriber was already installed.
pub fn init_logging(json: bool) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_line_number(true);

    let installed = if json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };
    if installed {
        info!("Sync logging initialized");
    }
    installed
}

/// Lifecycle record kept by [`SyncLogger`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncLogEntry {
    /// A cycle was started by the runner
    CycleStarted {
        /// Consecutive attempt number, starting at 1
        attempt: u32,
        /// RFC 3339 start time
        timestamp: String,
    },
    /// The processor entered a stage
    StageStarted {
        /// Stage entered
        stage: SyncStage,
    },
    /// A cycle completed
    CycleFinished {
        /// Scanned height after the cycle
        height: Option<BlockHeight>,
        /// Wall time of the cycle
        duration_ms: u64,
    },
    /// An invalid chain was rewound
    ChainReorg {
        /// Height validation failed at
        error_height: BlockHeight,
        /// Height the wallet was rewound to
        rewind_height: BlockHeight,
    },
    /// A cycle failed
    CycleFailed {
        /// Failure message
        error: String,
        /// Consecutive failures so far
        retry_count: u32,
    },
    /// The runner stopped
    Stopped,
}

/// Records runner lifecycle events and mirrors them to `tracing`.
#[derive(Debug, Default)]
pub struct SyncLogger {
    entries: Vec<SyncLogEntry>,
}

impl SyncLogger {
    /// Empty logger
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of a cycle.
    pub fn log_cycle_started(&mut self, attempt: u32) {
        let timestamp = chrono::Utc::now().to_rfc3339();
        info!(
            event = "cycle_started",
            attempt = attempt,
            timestamp = %timestamp,
            "Sync cycle started"
        );
        self.entries.push(SyncLogEntry::CycleStarted { attempt, timestamp });
    }

    /// Record a completed cycle.
    pub fn log_cycle_finished(&mut self, height: Option<BlockHeight>, duration_ms: u64) {
        info!(
            event = "cycle_finished",
            height = ?height,
            duration_ms = duration_ms,
            "Sync cycle finished"
        );
        self.entries
            .push(SyncLogEntry::CycleFinished { height, duration_ms });
    }

    /// Record a failed cycle.
    pub fn log_cycle_failed(&mut self, error_msg: &str, retry_count: u32) {
        error!(
            event = "cycle_failed",
            error = %error_msg,
            retry_count = retry_count,
            "Sync cycle failed"
        );
        self.entries.push(SyncLogEntry::CycleFailed {
            error: error_msg.to_string(),
            retry_count,
        });
    }

    /// Record that the runner stopped.
    pub fn log_stopped(&mut self) {
        info!(event = "runner_stopped", "Sync runner stopped");
        self.entries.push(SyncLogEntry::Stopped);
    }

    /// Record the lifecycle part of a processor event; progress events are
    /// only traced.
    pub fn log_event(&mut self, event: &SyncEvent) {
        match event {
            SyncEvent::StateChanged(state) => {
                debug!(event = "state_changed", state = ?state, "Processor state changed");
                if let crate::ProcessorState::Syncing(stage) = state {
                    self.entries.push(SyncLogEntry::StageStarted { stage: *stage });
                }
            }
            SyncEvent::ChainReorg {
                error_height,
                rewind_height,
            } => {
                warn!(
                    event = "chain_reorg",
                    error_height = error_height,
                    rewind_height = rewind_height,
                    "Chain reorganization handled"
                );
                self.entries.push(SyncLogEntry::ChainReorg {
                    error_height: *error_height,
                    rewind_height: *rewind_height,
                });
            }
            SyncEvent::Scanned { height, progress } => {
                debug!(event = "scan_progress", height = height, progress = progress);
            }
            SyncEvent::Downloaded { height, range } => {
                debug!(event = "download_progress", height = height, range = %range);
            }
            other => debug!(event = "sync_event", detail = ?other),
        }
    }

    /// Recorded entries, oldest first
    pub fn entries(&self) -> &[SyncLogEntry] {
        &self.entries
    }

    /// Entries as a JSON array.
    pub fn export_json(&self) -> String {
        serde_json::to_string(&self.entries).unwrap_or_else(|_| "[]".to_string())
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        debug!("Sync log cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProcessorState;

    #[test]
    fn test_sync_logger_records_lifecycle() {
        let mut logger = SyncLogger::new();
        logger.log_cycle_started(1);
        logger.log_event(&SyncEvent::StateChanged(ProcessorState::Syncing(
            SyncStage::Scanning,
        )));
        logger.log_event(&SyncEvent::Scanned {
            height: 10,
            progress: 0.5,
        });
        logger.log_cycle_finished(Some(20), 1_500);

        assert_eq!(logger.entries().len(), 3);
        assert_eq!(
            logger.entries()[1],
            SyncLogEntry::StageStarted {
                stage: SyncStage::Scanning
            }
        );
    }

    #[test]
    fn test_export_json_is_tagged() {
        let mut logger = SyncLogger::new();
        logger.log_cycle_failed("timeout", 2);
        let json = logger.export_json();
        assert!(json.contains("\"event\":\"cycle_failed\""));
        assert!(json.contains("\"retry_count\":2"));

        logger.clear();
        assert!(logger.entries().is_empty());
    }
}
