// src/services/grouping_hooks.rs
//
// Event-driven front end of the grouping core. Report events land in a pending
// batch; the batch is flushed when the debounce timer runs out or the batch is
// full. A flush fetches candidates (with retry), analyzes every pending report
// on blocking worker tasks and hands results to the host callbacks.
//
// The pending batch, the debounce timer and the bookkeeping of the running
// flush live behind a single tokio Mutex. Callbacks and analysis never run
// under it. Each flush runs on its own task so a caller that stops waiting
// cannot strand the batch half-processed.

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::{AppConfig, BatchConfig, FetchFailurePolicy};
use crate::error::{ErrorContext, GroupingError, Result};
use crate::grouping::analyzer::GroupingAnalyzer;
use crate::grouping::results::GroupingAnalysis;
use crate::models::{Report, ReportId};

use super::error_handler::ErrorHandler;
use super::types::{BatchPhase, BatchResult, CandidateSource, CandidateWindow, GroupingCallbacks};

#[derive(Default)]
struct BatchState {
    pending: Vec<Report>,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the timer is re-armed or cancelled; a timer that fires
    /// with an older value is stale
    timer_generation: u64,
    /// Bumped by `clear`; lets a running flush know its batch was discarded
    epoch: u64,
    /// Id of the flush currently running, if any
    active_flush: Option<u64>,
    /// Reports taken out of `pending` by the running flush
    in_flight: HashSet<ReportId>,
    /// In-flight reports deleted while the flush was running; never requeued
    deleted_during_flush: HashSet<ReportId>,
}

impl BatchState {
    fn is_processing(&self) -> bool {
        self.active_flush.is_some()
    }

    fn finish_flush(&mut self) {
        self.active_flush = None;
        self.in_flight.clear();
        self.deleted_during_flush.clear();
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.timer_generation += 1;
    }
}

struct Inner {
    analyzer: Arc<GroupingAnalyzer>,
    batch: BatchConfig,
    enable_auto_grouping: bool,
    temporal_window_days: i64,
    errors: Arc<ErrorHandler>,
    source: Arc<dyn CandidateSource>,
    callbacks: Arc<dyn GroupingCallbacks>,
    state: Mutex<BatchState>,
    next_flush_id: AtomicU64,
}

/// Cheap to clone; all clones share one batch.
#[derive(Clone)]
pub struct GroupingHooks {
    inner: Arc<Inner>,
}

impl GroupingHooks {
    pub fn new(
        config: &AppConfig,
        source: Arc<dyn CandidateSource>,
        callbacks: Arc<dyn GroupingCallbacks>,
        errors: Arc<ErrorHandler>,
    ) -> Result<Self> {
        config.validate()?;
        let analyzer = Arc::new(GroupingAnalyzer::new(config.grouping.clone())?);
        info!(
            "Grouping hooks ready: delay {}ms, max batch {}, {} analysis workers, auto-grouping {}",
            config.batch.batch_processing_delay_ms,
            config.batch.max_batch_size,
            config.batch.analysis_workers,
            if config.grouping.enable_auto_grouping { "on" } else { "off" }
        );
        Ok(Self {
            inner: Arc::new(Inner {
                analyzer,
                batch: config.batch.clone(),
                enable_auto_grouping: config.grouping.enable_auto_grouping,
                temporal_window_days: config.grouping.temporal_window_days,
                errors,
                source,
                callbacks,
                state: Mutex::new(BatchState::default()),
                next_flush_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn analyzer(&self) -> &Arc<GroupingAnalyzer> {
        &self.inner.analyzer
    }

    //--------------------------------------------------------------------------
    // EVENTS
    //--------------------------------------------------------------------------

    pub async fn report_created(&self, report: Report) {
        self.enqueue(report).await;
    }

    /// Queues `current` only if a field that affects grouping changed.
    pub async fn report_updated(&self, previous: &Report, current: Report) {
        if !current.has_meaningful_change(previous) {
            debug!("Report {} updated without grouping-relevant changes", current.id);
            return;
        }
        self.enqueue(current).await;
    }

    /// Drops the report from the pending batch. Existing groups are untouched.
    ///
    /// A report that the running flush already took is marked so that it is
    /// neither reported nor requeued when that flush ends. Returns whether the
    /// report was pending or in flight.
    pub async fn report_deleted(&self, report_id: &ReportId) -> bool {
        let mut state = self.inner.state.lock().await;
        let before = state.pending.len();
        state.pending.retain(|r| &r.id != report_id);
        let removed = state.pending.len() != before;
        if removed && state.pending.is_empty() {
            state.cancel_timer();
        }

        let in_flight = state.is_processing() && state.in_flight.contains(report_id);
        if in_flight {
            state.deleted_during_flush.insert(report_id.clone());
        }
        debug!(
            "Report {} deleted (was pending: {}, in flight: {})",
            report_id, removed, in_flight
        );
        removed || in_flight
    }

    async fn enqueue(&self, report: Report) {
        if !self.inner.enable_auto_grouping {
            debug!("Auto-grouping disabled; ignoring report {}", report.id);
            return;
        }

        let force_flush = {
            let mut state = self.inner.state.lock().await;
            // A newer snapshot of a pending report replaces the older one
            match state.pending.iter_mut().find(|r| r.id == report.id) {
                Some(existing) => *existing = report,
                None => state.pending.push(report),
            }

            if state.pending.len() >= self.inner.batch.max_batch_size {
                true
            } else {
                self.arm_timer(&mut state);
                false
            }
        };

        if force_flush {
            debug!("Batch size limit reached; flushing now");
            let hooks = self.clone();
            tokio::spawn(async move {
                hooks.flush().await;
            });
        }
    }

    //--------------------------------------------------------------------------
    // BATCH CONTROL
    //--------------------------------------------------------------------------

    pub async fn phase(&self) -> BatchPhase {
        let state = self.inner.state.lock().await;
        if state.is_processing() {
            BatchPhase::Flushing
        } else if state.pending.is_empty() {
            BatchPhase::Idle
        } else {
            BatchPhase::Accumulating
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    /// Cancel the debounce timer and drop every pending report.
    /// Returns how many reports were dropped.
    pub async fn clear(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        state.cancel_timer();
        state.epoch += 1;
        let dropped = state.pending.len();
        state.pending.clear();
        info!("Cleared grouping batch ({} pending reports dropped)", dropped);
        dropped
    }

    /// Process the pending batch now.
    ///
    /// Returns None without doing anything when the batch is empty or another
    /// flush is already running. The batch runs on its own task, so dropping
    /// the returned future does not abandon it: its reports are still analyzed
    /// or requeued and the batch goes back to idle.
    pub async fn flush(&self) -> Option<BatchResult> {
        let flush_id = self.inner.next_flush_id.fetch_add(1, AtomicOrdering::Relaxed);
        let hooks = self.clone();
        match tokio::spawn(async move { hooks.run_flush(flush_id).await }).await {
            Ok(result) => result,
            Err(e) => {
                {
                    let mut state = self.inner.state.lock().await;
                    if state.active_flush == Some(flush_id) {
                        state.finish_flush();
                    }
                }
                let error = GroupingError::from(e)
                    .with_context(ErrorContext::new("grouping_hooks", "flush"));
                self.inner.errors.report_uncaught(&error);
                None
            }
        }
    }

    async fn run_flush(&self, flush_id: u64) -> Option<BatchResult> {
        let (batch, epoch) = {
            let mut state = self.inner.state.lock().await;
            if state.is_processing() {
                debug!("Flush already in progress; skipping");
                return None;
            }
            if state.pending.is_empty() {
                return None;
            }
            state.cancel_timer();
            state.active_flush = Some(flush_id);
            let batch = std::mem::take(&mut state.pending);
            state.in_flight = batch.iter().map(|r| r.id.clone()).collect();
            (batch, state.epoch)
        };

        let (mut result, requeue) = self.process_batch(batch).await;

        {
            let mut state = self.inner.state.lock().await;
            let arrived_during_flush = !state.pending.is_empty();

            if !requeue.is_empty() {
                if state.epoch == epoch {
                    // Keep snapshots that arrived meanwhile; they are newer
                    let newer: HashSet<ReportId> =
                        state.pending.iter().map(|r| r.id.clone()).collect();
                    let mut restored: Vec<Report> = requeue
                        .into_iter()
                        .filter(|r| {
                            !newer.contains(&r.id) && !state.deleted_during_flush.contains(&r.id)
                        })
                        .collect();
                    result.requeued = restored.len();
                    restored.append(&mut state.pending);
                    state.pending = restored;
                } else {
                    info!("Batch was cleared during flush; not requeueing {} reports", requeue.len());
                    result.requeued = 0;
                }
            }
            state.finish_flush();

            // Reports that came in while flushing get their own debounce window.
            // A requeued batch waits for the next event or a manual flush.
            if arrived_during_flush && state.timer.is_none() {
                self.arm_timer(&mut state);
            }
        }

        self.inner.callbacks.on_batch_complete(&result);
        Some(result)
    }

    fn arm_timer(&self, state: &mut BatchState) {
        state.cancel_timer();
        let generation = state.timer_generation;
        let delay = Duration::from_millis(self.inner.batch.batch_processing_delay_ms);
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);

        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                GroupingHooks { inner }.on_timer(generation).await;
            }
        }));
    }

    async fn on_timer(&self, generation: u64) {
        {
            let mut state = self.inner.state.lock().await;
            if state.timer_generation != generation {
                return;
            }
            // This task is the timer; forget it so nothing aborts the flush below
            state.timer = None;
            if state.is_processing() {
                debug!("Debounce timer fired during a flush; re-arming");
                self.arm_timer(&mut state);
                return;
            }
        }
        self.flush().await;
    }

    //--------------------------------------------------------------------------
    // PROCESSING
    //--------------------------------------------------------------------------

    /// Runs one batch. Returns the result and the reports to put back.
    async fn process_batch(&self, batch: Vec<Report>) -> (BatchResult, Vec<Report>) {
        let start = Instant::now();
        let mut result = BatchResult::new();
        info!("Processing batch {} with {} reports", result.batch_id, batch.len());

        let Some(window) = CandidateWindow::for_reports(&batch, self.inner.temporal_window_days)
        else {
            return (result, Vec::new());
        };

        let candidates = match self.fetch_candidates(&window, &result.batch_id).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(
                    "Candidate fetch failed for batch {}; requeueing {} reports: {}",
                    result.batch_id,
                    batch.len(),
                    e
                );
                let deleted = self.deleted_during_flush().await;
                for report in batch.iter().filter(|r| !deleted.contains(&r.id)) {
                    self.inner.callbacks.on_grouping_error(&report.id, &e);
                }
                result.requeued = batch.len();
                result.batch_error = Some(e);
                result.elapsed = start.elapsed();
                return (result, batch);
            }
        };

        // Batch members are candidates for each other; their snapshots win
        let pool = {
            let batch_ids: HashSet<&ReportId> = batch.iter().map(|r| &r.id).collect();
            let mut pool: Vec<Report> = candidates
                .into_iter()
                .filter(|c| !batch_ids.contains(&c.id))
                .collect();
            pool.extend(batch.iter().cloned());
            Arc::new(pool)
        };
        debug!(
            "Batch {}: comparing against {} candidates",
            result.batch_id,
            pool.len()
        );

        let mut outcomes: Vec<(usize, ReportId, Result<GroupingAnalysis>)> =
            stream::iter(batch.into_iter().enumerate())
                .map(|(index, report)| {
                    let analyzer = Arc::clone(&self.inner.analyzer);
                    let errors = Arc::clone(&self.inner.errors);
                    let pool = Arc::clone(&pool);
                    async move {
                        let report_id = report.id.clone();
                        let context = ErrorContext::new("grouping_hooks", "analyze").for_report(&report_id);
                        let report = Arc::new(report);
                        let analysis = errors
                            .with_retry(&context, || {
                                let analyzer = Arc::clone(&analyzer);
                                let report = Arc::clone(&report);
                                let pool = Arc::clone(&pool);
                                async move {
                                    tokio::task::spawn_blocking(move || analyzer.analyze(&report, &pool))
                                        .await
                                        .unwrap_or_else(|e| Err(e.into()))
                                }
                            })
                            .await;
                        (index, report_id, analysis)
                    }
                })
                .buffer_unordered(self.inner.batch.analysis_workers.max(1))
                .collect()
                .await;
        outcomes.sort_by_key(|(index, _, _)| *index);

        let deleted = self.deleted_during_flush().await;
        for (_, report_id, outcome) in outcomes {
            if deleted.contains(&report_id) {
                debug!("Report {} was deleted during batch {}; dropping its result", report_id, result.batch_id);
                continue;
            }
            match outcome {
                Ok(analysis) => {
                    if analysis.has_matches() {
                        self.inner.callbacks.on_grouping_detected(&report_id, &analysis);
                    }
                    result.analyses.push(analysis);
                }
                Err(e) => {
                    self.inner.callbacks.on_grouping_error(&report_id, &e);
                    result.failures.push((report_id, e));
                }
            }
        }

        result.elapsed = start.elapsed();
        info!(
            "Batch {} done in {:.2?}: {} analyzed, {} with matches, {} failed",
            result.batch_id,
            result.elapsed,
            result.analyses.len(),
            result.analyses.iter().filter(|a| a.has_matches()).count(),
            result.failures.len()
        );
        (result, Vec::new())
    }

    async fn deleted_during_flush(&self) -> HashSet<ReportId> {
        self.inner.state.lock().await.deleted_during_flush.clone()
    }

    async fn fetch_candidates(&self, window: &CandidateWindow, batch_id: &str) -> Result<Vec<Report>> {
        let context = ErrorContext::new("grouping_hooks", "fetch_candidate_reports")
            .with_detail("batch_id", batch_id)
            .with_detail("batch_size", window.report_ids.len());
        let source = &self.inner.source;
        let errors = &self.inner.errors;

        match self.inner.batch.fetch_failure_policy {
            FetchFailurePolicy::Requeue => {
                errors
                    .with_retry(&context, || source.fetch_candidate_reports(window))
                    .await
            }
            FetchFailurePolicy::FallbackEmpty => {
                errors
                    .with_fallback(
                        &context,
                        || source.fetch_candidate_reports(window),
                        || async { Ok(Vec::new()) },
                    )
                    .await
            }
        }
    }
}
