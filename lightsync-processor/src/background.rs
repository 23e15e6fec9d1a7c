//! Background sync runner
//!
//! Runs processor cycles in a loop on a tokio task: waits a randomized poll
//! interval between cycles, re-runs at once when blocks were mined during a
//! cycle, and backs off after failures until the retry budget is spent.

use crate::cancel::CancelToken;
use crate::logging::SyncLogger;
use crate::processor::CompactBlockProcessor;
use crate::progress::SyncEvent;
use crate::{Error, Result};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delay before the next cycle: uniformly random in `[interval/2, 3*interval/2]`.
pub fn next_poll_delay(interval: Duration) -> Duration {
    let millis = interval.as_millis().min(u128::from(u64::MAX)) as u64;
    if millis < 2 {
        return interval;
    }
    let low = millis / 2;
    let high = millis + millis / 2;
    Duration::from_millis(rand::thread_rng().gen_range(low..=high))
}

/// Delay after the `attempts`-th consecutive failure.
pub fn backoff_delay(attempts: u32, interval: Duration, max_backoff: Duration) -> Duration {
    interval.saturating_mul(attempts.max(1)).min(max_backoff)
}

/// Loops sync cycles until stopped or out of retries.
pub struct SyncRunner {
    processor: Arc<CompactBlockProcessor>,
    cancel: CancelToken,
    logger: Arc<Mutex<SyncLogger>>,
    max_cycles: Option<u64>,
}

impl SyncRunner {
    /// Runner polling until cancelled.
    pub fn new(processor: Arc<CompactBlockProcessor>) -> Self {
        Self {
            processor,
            cancel: CancelToken::new(),
            logger: Arc::new(Mutex::new(SyncLogger::new())),
            max_cycles: None,
        }
    }

    /// Stop after `cycles` successful cycles.
    pub fn with_max_cycles(mut self, cycles: u64) -> Self {
        self.max_cycles = Some(cycles);
        self
    }

    /// Token that stops the runner and cancels the running cycle.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Shared lifecycle log
    pub fn logger(&self) -> Arc<Mutex<SyncLogger>> {
        Arc::clone(&self.logger)
    }

    /// Run until cancelled, until `max_cycles` succeeded, or until more
    /// than `retries` consecutive cycles failed (returning the last failure).
    pub async fn run(&self) -> Result<()> {
        let config = self.processor.config().clone();
        let poll = config.block_poll_interval();
        let mut events = self.processor.subscribe();
        let mut retry_attempts: u32 = 0;
        let mut completed: u64 = 0;

        info!(
            "Sync runner started (poll {:?}, retries {})",
            poll, config.retries
        );

        loop {
            if self.cancel.is_cancelled() {
                self.logger.lock().log_stopped();
                return Ok(());
            }

            self.logger.lock().log_cycle_started(retry_attempts + 1);
            let started = Instant::now();
            let outcome = self.processor.run_cycle(&self.cancel).await;
            self.drain_events(&mut events);

            let delay = match outcome {
                Ok(report) => {
                    retry_attempts = 0;
                    completed += 1;
                    self.logger.lock().log_cycle_finished(
                        report.scanned_height,
                        started.elapsed().as_millis() as u64,
                    );
                    if self.max_cycles.is_some_and(|max| completed >= max) {
                        info!("Sync runner finished after {} cycles", completed);
                        return Ok(());
                    }

                    match self.processor.latest_height().await {
                        Ok(height) if height > report.tip => {
                            debug!("Tip moved to {} during cycle; syncing again", height);
                            continue;
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Failed to refresh chain tip: {}", e),
                    }
                    next_poll_delay(poll)
                }
                Err(Error::Cancelled) => {
                    self.logger.lock().log_stopped();
                    return Ok(());
                }
                Err(Error::SyncInProgress) => {
                    debug!("Cycle already running; waiting for next poll");
                    next_poll_delay(poll)
                }
                Err(e) => {
                    retry_attempts += 1;
                    self.logger.lock().log_cycle_failed(&e.to_string(), retry_attempts);
                    if retry_attempts > config.retries {
                        warn!("Giving up after {} failed cycles", retry_attempts);
                        return Err(e);
                    }
                    let delay = backoff_delay(retry_attempts, poll, config.max_backoff_interval());
                    info!(
                        "Retrying sync in {:?} (attempt {}/{})",
                        delay, retry_attempts, config.retries
                    );
                    delay
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.logger.lock().log_stopped();
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run on a new tokio task.
    pub fn spawn(self) -> SyncRunnerHandle {
        let cancel = self.cancel.clone();
        let logger = Arc::clone(&self.logger);
        let task = tokio::spawn(async move { self.run().await });
        SyncRunnerHandle {
            cancel,
            logger,
            task,
        }
    }

    fn drain_events(&self, events: &mut broadcast::Receiver<SyncEvent>) {
        let mut logger = self.logger.lock();
        loop {
            match events.try_recv() {
                Ok(event) => logger.log_event(&event),
                Err(TryRecvError::Lagged(skipped)) => {
                    debug!("Event log skipped {} events", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }
}

/// Handle to a spawned [`SyncRunner`].
pub struct SyncRunnerHandle {
    cancel: CancelToken,
    logger: Arc<Mutex<SyncLogger>>,
    task: JoinHandle<Result<()>>,
}

impl SyncRunnerHandle {
    /// Request the runner to stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Shared lifecycle log
    pub fn logger(&self) -> Arc<Mutex<SyncLogger>> {
        Arc::clone(&self.logger)
    }

    /// Whether the runner task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the runner to exit.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| Error::Engine(format!("sync runner task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_delay_is_jittered_around_interval() {
        let interval = Duration::from_secs(20);
        for _ in 0..100 {
            let delay = next_poll_delay(interval);
            assert!(delay >= Duration::from_secs(10));
            assert!(delay <= Duration::from_secs(30));
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let poll = Duration::from_secs(20);
        let max = Duration::from_secs(600);
        assert_eq!(backoff_delay(1, poll, max), Duration::from_secs(20));
        assert_eq!(backoff_delay(3, poll, max), Duration::from_secs(60));
        assert_eq!(backoff_delay(100, poll, max), max);
    }
}
