//! Sync metrics
//!
//! Per-operation timing samples, their min/max/avg summaries, and per-stage
//! timing of the processor state machine.
//!
//! Block samples are ignored until [`SdkMetrics::enable_metrics`] is called.
//! Stage timing is always collected and reset by [`SdkMetrics::cbp_start`]
//! at the start of every cycle.

use crate::model::{BlockHeight, CompactBlockRange};
use crate::progress::SyncStage;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Measured operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MetricOperation {
    /// Block download batches
    DownloadBlocks,
    /// Chain validation
    ValidateBlocks,
    /// Scan batches
    ScanBlocks,
    /// Transaction enhancement
    Enhancement,
    /// Transparent UTXO fetch
    FetchUtxos,
}

/// Position within a height window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockProgress {
    /// First height of the window
    pub start_height: BlockHeight,
    /// Last height of the window
    pub target_height: BlockHeight,
    /// Height reached
    pub progress_height: BlockHeight,
}

impl BlockProgress {
    /// Progress at `progress_height` within `range`.
    pub fn in_range(range: CompactBlockRange, progress_height: BlockHeight) -> Self {
        Self {
            start_height: range.lower(),
            target_height: range.upper(),
            progress_height,
        }
    }

    /// Fraction done, clamped to 0..=1
    pub fn progress(&self) -> f32 {
        let total = self.target_height.saturating_sub(self.start_height);
        if total == 0 {
            return if self.progress_height >= self.target_height {
                1.0
            } else {
                0.0
            };
        }
        let done = self.progress_height.saturating_sub(self.start_height);
        (done as f32 / total as f32).clamp(0.0, 1.0)
    }
}

/// One timed sample of a block operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockMetricReport {
    /// First height of the window
    pub start_height: BlockHeight,
    /// Height reached by this sample
    pub progress_height: BlockHeight,
    /// Last height of the window
    pub target_height: BlockHeight,
    /// Blocks covered by the sample
    pub batch_size: u64,
    /// Sample start
    pub start: DateTime<Utc>,
    /// Sample end
    pub end: DateTime<Utc>,
}

impl BlockMetricReport {
    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        seconds_between(self.start, self.end)
    }
}

/// Timing of a whole sync.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    /// Sync start
    pub start: DateTime<Utc>,
    /// Sync end
    pub end: DateTime<Utc>,
}

impl SyncReport {
    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        seconds_between(self.start, self.end)
    }
}

/// Min, max and average duration in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReportSummary {
    /// Shortest sample
    pub min_time: f64,
    /// Longest sample
    pub max_time: f64,
    /// Mean sample
    pub avg_time: f64,
}

impl ReportSummary {
    /// All-zero summary
    pub const ZERO: ReportSummary = ReportSummary {
        min_time: 0.0,
        max_time: 0.0,
        avg_time: 0.0,
    };
}

/// Summary per operation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct CumulativeSummary {
    /// Download batches
    pub downloaded_blocks_report: Option<ReportSummary>,
    /// Validation runs
    pub validated_blocks_report: Option<ReportSummary>,
    /// Scan batches
    pub scanned_blocks_report: Option<ReportSummary>,
    /// Enhancement runs
    pub enhancement_report: Option<ReportSummary>,
    /// UTXO fetches
    pub fetch_utxos_report: Option<ReportSummary>,
    /// Whole sync
    pub total_sync_report: Option<ReportSummary>,
}

/// Timing of one pipeline stage within a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CbpStateMetricReport {
    /// Times the stage started
    pub runs: u32,
    /// Start of the open run, if any
    pub start_time: Option<Instant>,
    /// Total time across closed runs
    pub cumulative_time: Duration,
    /// Shortest closed run
    pub min_time: Duration,
    /// Longest closed run
    pub max_time: Duration,
    /// Mean closed run
    pub avg_time: Duration,
    /// Free-form notes attached by the stage
    pub details: Vec<String>,
}

impl Default for CbpStateMetricReport {
    fn default() -> Self {
        Self {
            runs: 0,
            start_time: None,
            cumulative_time: Duration::ZERO,
            min_time: Duration::MAX,
            max_time: Duration::ZERO,
            avg_time: Duration::ZERO,
            details: Vec::new(),
        }
    }
}

impl CbpStateMetricReport {
    fn close(&mut self, now: Instant) {
        let Some(start) = self.start_time.take() else {
            return;
        };
        let elapsed = now.saturating_duration_since(start);
        self.cumulative_time += elapsed;
        self.min_time = self.min_time.min(elapsed);
        self.max_time = self.max_time.max(elapsed);
        self.avg_time = self.cumulative_time / self.runs.max(1);
    }
}

#[derive(Debug, Default)]
struct MetricsInner {
    enabled: bool,
    reports: HashMap<MetricOperation, Vec<BlockMetricReport>>,
    cumulative_summaries: Vec<CumulativeSummary>,
    sync_report: Option<SyncReport>,
    stages: HashMap<SyncStage, CbpStateMetricReport>,
    open_stage: Option<SyncStage>,
    cycle_start: Option<Instant>,
}

/// Sync metrics collector, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct SdkMetrics {
    inner: Arc<Mutex<MetricsInner>>,
}

impl SdkMetrics {
    /// Metrics with sampling disabled
    pub fn new() -> Self {
        Self::default()
    }

    /// Start collecting block samples.
    pub fn enable_metrics(&self) {
        self.inner.lock().enabled = true;
    }

    /// Stop collecting and drop everything collected.
    pub fn disable_metrics(&self) {
        let mut inner = self.inner.lock();
        inner.enabled = false;
        inner.reports.clear();
        inner.cumulative_summaries.clear();
        inner.sync_report = None;
    }

    /// Whether samples are collected
    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Record one sample for `operation`.
    pub fn push_progress_report(
        &self,
        progress: BlockProgress,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        batch_size: u64,
        operation: MetricOperation,
    ) {
        let mut inner = self.inner.lock();
        if !inner.enabled {
            return;
        }
        inner
            .reports
            .entry(operation)
            .or_default()
            .push(BlockMetricReport {
                start_height: progress.start_height,
                progress_height: progress.progress_height,
                target_height: progress.target_height,
                batch_size,
                start,
                end,
            });
    }

    /// Record the timing of a whole sync.
    pub fn push_sync_report(&self, start: DateTime<Utc>, end: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        if !inner.enabled {
            return;
        }
        inner.sync_report = Some(SyncReport { start, end });
    }

    /// Timing of the last sync, if recorded
    pub fn sync_report(&self) -> Option<SyncReport> {
        self.inner.lock().sync_report.clone()
    }

    /// Samples of `operation`, removed when `flush` is set.
    pub fn pop_block(&self, operation: MetricOperation, flush: bool) -> Option<Vec<BlockMetricReport>> {
        let mut inner = self.inner.lock();
        if flush {
            inner.reports.remove(&operation)
        } else {
            inner.reports.get(&operation).cloned()
        }
    }

    /// Every sample. Flushing also drops the cumulative summaries.
    pub fn pop_all_block_reports(
        &self,
        flush: bool,
    ) -> HashMap<MetricOperation, Vec<BlockMetricReport>> {
        let mut inner = self.inner.lock();
        if flush {
            inner.cumulative_summaries.clear();
            std::mem::take(&mut inner.reports)
        } else {
            inner.reports.clone()
        }
    }

    /// Summary of the samples collected so far.
    pub fn cumulative_summary(&self) -> CumulativeSummary {
        let inner = self.inner.lock();
        Self::summarize(&inner)
    }

    fn summarize(inner: &MetricsInner) -> CumulativeSummary {
        let of = |op: MetricOperation| summary_for(inner.reports.get(&op).map(Vec::as_slice));
        CumulativeSummary {
            downloaded_blocks_report: of(MetricOperation::DownloadBlocks),
            validated_blocks_report: of(MetricOperation::ValidateBlocks),
            scanned_blocks_report: of(MetricOperation::ScanBlocks),
            enhancement_report: of(MetricOperation::Enhancement),
            fetch_utxos_report: of(MetricOperation::FetchUtxos),
            total_sync_report: inner.sync_report.as_ref().map(|report| {
                let duration = report.duration();
                ReportSummary {
                    min_time: duration,
                    max_time: duration,
                    avg_time: duration,
                }
            }),
        }
    }

    /// Store the current summary and start a new set of samples.
    pub fn cumulate_reports_and_start_new_set(&self) {
        let mut inner = self.inner.lock();
        let summary = Self::summarize(&inner);
        inner.cumulative_summaries.push(summary);
        inner.reports.clear();
        inner.sync_report = None;
    }

    /// Summaries stored so far, oldest first
    pub fn cumulative_summaries(&self) -> Vec<CumulativeSummary> {
        self.inner.lock().cumulative_summaries.clone()
    }

    /// Merge every stored summary into one.
    pub fn summarized_cumulative_reports(&self) -> Option<CumulativeSummary> {
        let inner = self.inner.lock();
        let mut summaries = inner.cumulative_summaries.iter();
        let first = *summaries.next()?;
        Some(summaries.fold(first, |acc, next| CumulativeSummary {
            downloaded_blocks_report: accumulate(
                acc.downloaded_blocks_report,
                next.downloaded_blocks_report,
            ),
            validated_blocks_report: accumulate(
                acc.validated_blocks_report,
                next.validated_blocks_report,
            ),
            scanned_blocks_report: accumulate(acc.scanned_blocks_report, next.scanned_blocks_report),
            enhancement_report: accumulate(acc.enhancement_report, next.enhancement_report),
            fetch_utxos_report: accumulate(acc.fetch_utxos_report, next.fetch_utxos_report),
            total_sync_report: accumulate(acc.total_sync_report, next.total_sync_report),
        }))
    }

    // ========================================================================
    // Stage timing
    // ========================================================================

    /// Reset stage timing at the start of a cycle.
    pub fn cbp_start(&self) {
        let mut inner = self.inner.lock();
        inner.stages.clear();
        inner.open_stage = None;
        inner.cycle_start = Some(Instant::now());
    }

    /// Start timing `stage`, closing the stage currently open.
    pub fn action_start(&self, stage: SyncStage) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if let Some(open) = inner.open_stage.take() {
            if let Some(report) = inner.stages.get_mut(&open) {
                report.close(now);
            }
        }
        let report = inner.stages.entry(stage).or_default();
        report.runs += 1;
        report.start_time = Some(now);
        inner.open_stage = Some(stage);
    }

    /// Close the open stage, if any.
    pub fn action_stop(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if let Some(open) = inner.open_stage.take() {
            if let Some(report) = inner.stages.get_mut(&open) {
                report.close(now);
            }
        }
    }

    /// Attach a note to `stage`.
    pub fn action_detail(&self, stage: SyncStage, detail: impl Into<String>) {
        self.inner
            .lock()
            .stages
            .entry(stage)
            .or_default()
            .details
            .push(detail.into());
    }

    /// Currently open stage
    pub fn open_stage(&self) -> Option<SyncStage> {
        self.inner.lock().open_stage
    }

    /// Timing of `stage` in the current cycle
    pub fn cbp_state_report(&self, stage: SyncStage) -> Option<CbpStateMetricReport> {
        self.inner.lock().stages.get(&stage).cloned()
    }

    /// Human readable overview of the current cycle.
    pub fn cbp_overview(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::from("Sync cycle overview");
        if let Some(start) = inner.cycle_start {
            let _ = write!(out, " (total {:.3}s)", start.elapsed().as_secs_f64());
        }
        for stage in SyncStage::ALL {
            let Some(report) = inner.stages.get(&stage) else {
                continue;
            };
            let min = if report.min_time == Duration::MAX {
                Duration::ZERO
            } else {
                report.min_time
            };
            let _ = write!(
                out,
                "\n  {}: runs={} total={:.3}s min={:.3}s max={:.3}s avg={:.3}s",
                stage.name(),
                report.runs,
                report.cumulative_time.as_secs_f64(),
                min.as_secs_f64(),
                report.max_time.as_secs_f64(),
                report.avg_time.as_secs_f64()
            );
            for detail in &report.details {
                let _ = write!(out, "\n    {}", detail);
            }
        }
        out
    }
}

/// Merge two summaries: min of mins, max of maxes, mean of averages.
pub fn accumulate(left: Option<ReportSummary>, right: Option<ReportSummary>) -> Option<ReportSummary> {
    match (left, right) {
        (Some(l), Some(r)) => Some(ReportSummary {
            min_time: l.min_time.min(r.min_time),
            max_time: l.max_time.max(r.max_time),
            avg_time: (l.avg_time + r.avg_time) * 0.5,
        }),
        (None, right) => right,
        (left, None) => left,
    }
}

/// Min, max and average duration of `reports`; `None` when empty.
pub fn summary_for(reports: Option<&[BlockMetricReport]>) -> Option<ReportSummary> {
    let reports = reports.filter(|r| !r.is_empty())?;
    let mut min = f64::MAX;
    let mut max = 0.0f64;
    let mut total = 0.0f64;
    for report in reports {
        let duration = report.duration();
        total += duration;
        min = min.min(duration);
        max = max.max(duration);
    }
    Some(ReportSummary {
        min_time: min,
        max_time: max,
        avg_time: total / reports.len() as f64,
    })
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let delta = end - start;
    match delta.num_microseconds() {
        Some(micros) => micros as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1_000.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn push(metrics: &SdkMetrics, progress_height: u64, seconds: i64) {
        metrics.push_progress_report(
            BlockProgress {
                start_height: 1_730_000,
                target_height: 1_730_099,
                progress_height,
            },
            at(0),
            at(seconds),
            10,
            MetricOperation::DownloadBlocks,
        );
    }

    fn download_only(summary: ReportSummary) -> CumulativeSummary {
        CumulativeSummary {
            downloaded_blocks_report: Some(summary),
            ..Default::default()
        }
    }

    #[test]
    fn test_disabled_metrics_ignore_samples() {
        let metrics = SdkMetrics::new();
        push(&metrics, 1_730_050, 1);
        assert!(metrics.pop_block(MetricOperation::DownloadBlocks, false).is_none());
    }

    #[test]
    fn test_push_and_pop_download_report() {
        let metrics = SdkMetrics::new();
        metrics.enable_metrics();
        push(&metrics, 1_730_050, 1);

        let reports = metrics
            .pop_block(MetricOperation::DownloadBlocks, true)
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].progress_height, 1_730_050);
        assert_eq!(reports[0].duration(), 1.0);
        assert!(metrics.pop_block(MetricOperation::DownloadBlocks, false).is_none());
    }

    #[test]
    fn test_cumulative_summary_min_max_avg() {
        let metrics = SdkMetrics::new();
        metrics.enable_metrics();
        push(&metrics, 1_730_050, 1);
        push(&metrics, 1_730_080, 6);

        assert_eq!(
            metrics.cumulative_summary(),
            download_only(ReportSummary {
                min_time: 1.0,
                max_time: 6.0,
                avg_time: 3.5
            })
        );
    }

    #[test]
    fn test_summarized_cumulative_reports() {
        let metrics = SdkMetrics::new();
        metrics.enable_metrics();
        push(&metrics, 1_730_050, 1);
        metrics.cumulate_reports_and_start_new_set();
        push(&metrics, 1_730_080, 6);
        metrics.cumulate_reports_and_start_new_set();

        assert_eq!(metrics.cumulative_summaries().len(), 2);
        assert_eq!(
            metrics.summarized_cumulative_reports(),
            Some(download_only(ReportSummary {
                min_time: 1.0,
                max_time: 6.0,
                avg_time: 3.5
            }))
        );

        metrics.disable_metrics();
        assert!(metrics.summarized_cumulative_reports().is_none());
    }

    #[test]
    fn test_accumulate_keeps_present_side() {
        let summary = ReportSummary {
            min_time: 2.0,
            max_time: 4.0,
            avg_time: 3.0,
        };
        assert_eq!(accumulate(None, Some(summary)), Some(summary));
        assert_eq!(accumulate(Some(summary), None), Some(summary));
        assert_eq!(accumulate(None, None), None);
        assert_eq!(summary_for(Some(&[][..])), None);
    }

    #[test]
    fn test_action_start_closes_previous_stage() {
        let metrics = SdkMetrics::new();
        metrics.cbp_start();
        metrics.action_start(SyncStage::Downloading);
        metrics.action_start(SyncStage::Validating);

        let download = metrics.cbp_state_report(SyncStage::Downloading).unwrap();
        assert_eq!(download.runs, 1);
        assert!(download.start_time.is_none());
        assert_eq!(metrics.open_stage(), Some(SyncStage::Validating));

        metrics.action_stop();
        assert_eq!(metrics.open_stage(), None);
        metrics.action_detail(SyncStage::Validating, "limit=100");

        let overview = metrics.cbp_overview();
        assert!(overview.contains("Downloading: runs=1"));
        assert!(overview.contains("limit=100"));

        metrics.cbp_start();
        assert!(metrics.cbp_state_report(SyncStage::Downloading).is_none());
    }

    #[test]
    fn test_block_progress_fraction() {
        let range = CompactBlockRange::new(100, 200).unwrap();
        assert_eq!(BlockProgress::in_range(range, 150).progress(), 0.5);
        assert_eq!(BlockProgress::in_range(range, 250).progress(), 1.0);
        let single = CompactBlockRange::new(7, 7).unwrap();
        assert_eq!(BlockProgress::in_range(single, 7).progress(), 1.0);
    }

    #[test]
    fn test_reports_serialize_with_timestamps() {
        let metrics = SdkMetrics::new();
        metrics.enable_metrics();
        push(&metrics, 1_730_100, 4);
        metrics.push_sync_report(at(1_000), at(1_060));

        let samples = metrics.pop_block(MetricOperation::DownloadBlocks, false).unwrap();
        let json = serde_json::to_value(&samples[0]).unwrap();
        assert_eq!(json["progress_height"], 1_730_100);
        assert!(json["start"].as_str().is_some());

        let report = serde_json::to_value(metrics.sync_report().unwrap()).unwrap();
        assert_eq!(report["end"], serde_json::json!(at(1_060)));
    }
}
