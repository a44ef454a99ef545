// src/services/types.rs
//
// Types shared by the hook layer and the collaborators the host plugs into it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{GroupingError, Result};
use crate::grouping::results::GroupingAnalysis;
use crate::models::{Report, ReportId};

/// Where the batch window currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPhase {
    /// Nothing pending
    Idle,
    /// Reports pending, waiting for the debounce timer or the size limit
    Accumulating,
    /// A flush is running
    Flushing,
}

/// Hint passed to the candidate source: which time range and reports the
/// batch needs candidates for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateWindow {
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
    pub report_ids: Vec<ReportId>,
    pub categories: Vec<String>,
}

impl CandidateWindow {
    /// Time range covering every report in `reports`, widened by `window_days`
    /// on both sides. None for an empty batch.
    pub fn for_reports(reports: &[Report], window_days: i64) -> Option<Self> {
        let earliest = reports.iter().map(|r| r.created_at).min()?;
        let latest = reports.iter().map(|r| r.created_at).max()?;
        let widen = chrono::Duration::try_days(window_days).unwrap_or(chrono::Duration::MAX);

        let mut categories: Vec<String> = reports.iter().map(|r| r.category.clone()).collect();
        categories.sort();
        categories.dedup();

        Some(Self {
            earliest: earliest
                .checked_sub_signed(widen)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            latest: latest
                .checked_add_signed(widen)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            report_ids: reports.iter().map(|r| r.id.clone()).collect(),
            categories,
        })
    }
}

/// Summary of one flush
#[derive(Debug, Default)]
pub struct BatchResult {
    pub batch_id: String,
    pub analyses: Vec<GroupingAnalysis>,
    /// Reports whose analysis failed, with the error reported for each
    pub failures: Vec<(ReportId, GroupingError)>,
    /// Set when the batch as a whole could not run (candidate fetch failed)
    pub batch_error: Option<GroupingError>,
    /// Reports put back into the pending set because the batch could not run
    pub requeued: usize,
    pub elapsed: Duration,
}

impl BatchResult {
    pub fn new() -> Self {
        Self {
            batch_id: Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }

    pub fn processed(&self) -> usize {
        self.analyses.len() + self.failures.len()
    }
}

/// Supplies comparison candidates. May return an empty list.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn fetch_candidate_reports(&self, window: &CandidateWindow) -> Result<Vec<Report>>;
}

/// Result callbacks the host wires to persistence and notification.
/// Every method defaults to doing nothing.
pub trait GroupingCallbacks: Send + Sync {
    /// Called for each analysis that has at least one qualifying match
    fn on_grouping_detected(&self, _report_id: &ReportId, _analysis: &GroupingAnalysis) {}

    fn on_grouping_error(&self, _report_id: &ReportId, _error: &GroupingError) {}

    fn on_batch_complete(&self, _result: &BatchResult) {}
}

/// Callbacks that ignore everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl GroupingCallbacks for NoopCallbacks {}
