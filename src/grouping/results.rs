// src/grouping/results.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::matching::geospatial::ProximityResult;
use crate::matching::text::TextSimilarity;
use crate::models::{GroupId, GroupingReason, ReportId};

/// Version tag stamped on every analysis and group
pub const ALGORITHM_VERSION: &str = "weighted-cosine-haversine/1.2";

/// What the analyzer suggests doing with a candidate pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    /// Strong, trustworthy evidence: merge automatically
    Group,
    /// Plausible duplicate: ask a human
    Review,
    /// Treat as distinct reports
    Separate,
}

/// Individual signal results for one pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairSignals {
    pub text: TextSimilarity,
    /// None when either report has no coordinates
    pub proximity: Option<ProximityResult>,
    pub category_match: bool,
    pub status_compatible: bool,
    pub priority_aligned: bool,
    pub temporal_gap_days: f64,
}

/// Scored comparison of the target report against one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairAnalysis {
    pub candidate_id: ReportId,
    /// Strength of the evidence, 0-1
    pub overall_score: f64,
    /// Quality of the evidence, 0-1
    pub confidence: f64,
    pub signals: PairSignals,
    pub recommendation: Recommendation,
    /// Signals that contributed to `overall_score`
    pub reasons: Vec<GroupingReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisMetadata {
    pub analyzed_at: DateTime<Utc>,
    pub algorithm_version: String,
    pub processing_time_ms: f64,
    /// Candidates passed in by the caller
    pub candidates_received: usize,
    /// Candidates left after self-exclusion and the temporal window
    pub candidates_compared: usize,
}

/// Full result for one target report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupingAnalysis {
    pub report_id: ReportId,
    /// Qualifying pairs, best first
    pub matches: Vec<PairAnalysis>,
    pub suggested_group_id: Option<GroupId>,
    pub metadata: AnalysisMetadata,
}

impl GroupingAnalysis {
    pub fn has_matches(&self) -> bool {
        !self.matches.is_empty()
    }

    pub fn best_match(&self) -> Option<&PairAnalysis> {
        self.matches.first()
    }

    /// Pairs recommended for automatic grouping, best first
    pub fn group_matches(&self) -> impl Iterator<Item = &PairAnalysis> {
        self.matches
            .iter()
            .filter(|m| m.recommendation == Recommendation::Group)
    }

    pub fn review_matches(&self) -> impl Iterator<Item = &PairAnalysis> {
        self.matches
            .iter()
            .filter(|m| m.recommendation == Recommendation::Review)
    }

    pub fn match_for(&self, candidate_id: &ReportId) -> Option<&PairAnalysis> {
        self.matches.iter().find(|m| &m.candidate_id == candidate_id)
    }
}
