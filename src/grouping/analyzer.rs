// src/grouping/analyzer.rs
//
// Pairwise grouping analysis. For a target report, every candidate inside the
// temporal window is scored on text, proximity, category, status, priority and
// time, then turned into a group / review / separate recommendation.
//
// The analyzer holds no mutable state; one instance can be shared across
// worker tasks behind an Arc.

use chrono::Utc;
use log::{debug, info, trace, warn};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::config::GroupingConfig;
use crate::error::{ErrorContext, GroupingError, Result};
use crate::matching::geospatial::{self, ProximityResult};
use crate::matching::text::{self, TextSimilarity, VectorCache};
use crate::models::{GroupId, GroupingReason, Report, ReportId};

use super::results::{
    ALGORITHM_VERSION, AnalysisMetadata, GroupingAnalysis, PairAnalysis, PairSignals,
    Recommendation,
};

// Confidence proxies for the boolean signals
const CATEGORY_MATCH_CONFIDENCE: f64 = 1.0;
const STATUS_COMPATIBLE_CONFIDENCE: f64 = 0.8;
const PRIORITY_ALIGNED_CONFIDENCE: f64 = 0.7;

// Final confidence = 70% evidence quality + 30% score
const EVIDENCE_CONFIDENCE_SHARE: f64 = 0.7;
const SCORE_CONFIDENCE_SHARE: f64 = 0.3;

/// A within-radius pair contributes 1.0 at zero distance, decaying linearly to
/// this value at the radius edge.
const PROXIMITY_SCORE_AT_RADIUS: f64 = 0.5;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Result of analyzing a whole corpus: one analysis per report that could be
/// analyzed, plus the reports that failed.
#[derive(Debug, Default)]
pub struct AnalyzeAllOutcome {
    pub analyses: Vec<GroupingAnalysis>,
    pub failures: Vec<(ReportId, GroupingError)>,
}

pub struct GroupingAnalyzer {
    config: GroupingConfig,
}

impl GroupingAnalyzer {
    pub fn new(config: GroupingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &GroupingConfig {
        &self.config
    }

    /// Analyze `target` against `candidates`.
    pub fn analyze(&self, target: &Report, candidates: &[Report]) -> Result<GroupingAnalysis> {
        let mut cache = VectorCache::new();
        self.analyze_with_cache(target, candidates, &mut cache)
    }

    /// Same as [`analyze`](Self::analyze), reusing text vectors from `cache`.
    pub fn analyze_with_cache(
        &self,
        target: &Report,
        candidates: &[Report],
        cache: &mut VectorCache,
    ) -> Result<GroupingAnalysis> {
        let start = Instant::now();
        validate_report(target)?;

        let filtered = self.filter_candidates(target, candidates);
        trace!(
            "Report {}: {} of {} candidates inside the {}-day window",
            target.id,
            filtered.len(),
            candidates.len(),
            self.config.temporal_window_days
        );

        let mut matches = Vec::new();
        for candidate in &filtered {
            let pair = match self.analyze_pair_with_cache(target, candidate, cache) {
                Ok(pair) => pair,
                Err(e) => {
                    // One malformed candidate must not sink the whole analysis
                    warn!(
                        "Skipping candidate {} for report {}: {}",
                        candidate.id, target.id, e
                    );
                    continue;
                }
            };
            if pair.overall_score >= self.config.min_confidence_threshold {
                matches.push(pair);
            }
        }

        matches.sort_by(compare_pairs);

        let suggested_group_id = if matches
            .iter()
            .any(|m| m.recommendation == Recommendation::Group)
        {
            Some(GroupId::generate())
        } else {
            None
        };

        let elapsed = start.elapsed();
        debug!(
            "Analyzed report {} against {} candidates: {} qualifying matches in {:.2?}",
            target.id,
            filtered.len(),
            matches.len(),
            elapsed
        );

        Ok(GroupingAnalysis {
            report_id: target.id.clone(),
            matches,
            suggested_group_id,
            metadata: AnalysisMetadata {
                analyzed_at: Utc::now(),
                algorithm_version: ALGORITHM_VERSION.to_string(),
                processing_time_ms: elapsed.as_secs_f64() * 1000.0,
                candidates_received: candidates.len(),
                candidates_compared: filtered.len(),
            },
        })
    }

    /// Candidates other than the target itself whose creation time lies within
    /// `temporal_window_days` of the target's, in either direction.
    pub fn filter_candidates<'a>(&self, target: &Report, candidates: &'a [Report]) -> Vec<&'a Report> {
        let window = chrono::Duration::try_days(self.config.temporal_window_days)
            .unwrap_or(chrono::Duration::MAX);
        candidates
            .iter()
            .filter(|c| c.id != target.id)
            .filter(|c| (target.created_at - c.created_at).abs() <= window)
            .collect()
    }

    /// Score a single pair.
    pub fn analyze_pair(&self, target: &Report, candidate: &Report) -> Result<PairAnalysis> {
        let mut cache = VectorCache::new();
        self.analyze_pair_with_cache(target, candidate, &mut cache)
    }

    pub fn analyze_pair_with_cache(
        &self,
        target: &Report,
        candidate: &Report,
        cache: &mut VectorCache,
    ) -> Result<PairAnalysis> {
        validate_report(candidate)?;

        let text = text::calculate_similarity_cached(
            &target.combined_text(),
            &candidate.combined_text(),
            cache,
        );
        let proximity = self.proximity(target, candidate);
        let category_match = categories_match(&target.category, &candidate.category);
        let status_compatible = self
            .config
            .statuses_compatible(target.status, candidate.status);
        let priority_gap = target.priority.rank().abs_diff(candidate.priority.rank());
        let priority_aligned = priority_gap <= self.config.max_priority_distance;
        let temporal_gap_days =
            (target.created_at - candidate.created_at).num_milliseconds().abs() as f64 / MILLIS_PER_DAY;

        let (overall_score, reasons) = self.weighted_score(&text, proximity.as_ref(), category_match);

        let signals = PairSignals {
            text,
            proximity,
            category_match,
            status_compatible,
            priority_aligned,
            temporal_gap_days,
        };
        let confidence = self.confidence(&signals, overall_score);
        let recommendation = self.recommend(overall_score, confidence);

        trace!(
            "Pair ({}, {}): score {:.3}, confidence {:.3} -> {:?}",
            target.id, candidate.id, overall_score, confidence, recommendation
        );

        Ok(PairAnalysis {
            candidate_id: candidate.id.clone(),
            overall_score,
            confidence,
            signals,
            recommendation,
            reasons,
        })
    }

    fn proximity(&self, a: &Report, b: &Report) -> Option<ProximityResult> {
        let (loc_a, loc_b) = (a.location?, b.location?);
        let uncertainty = [
            a.metadata.location_accuracy_meters,
            b.metadata.location_accuracy_meters,
        ]
        .into_iter()
        .flatten()
        .filter(|m| m.is_finite() && *m >= 0.0)
        .fold(0.0, f64::max);

        Some(geospatial::within_radius_with_uncertainty(
            &loc_a,
            &loc_b,
            self.config.proximity_radius_meters,
            uncertainty,
            &self.config.accuracy_tiers,
        ))
    }

    /// Weighted mean over the signals that actually contribute.
    ///
    /// Proximity contributes only when within the radius and text only when it
    /// clears the similarity threshold. Category is not counted merely because
    /// the categories are equal: it also needs proximity or text to contribute.
    /// A plain "category if equal" term would make a category-only pair its
    /// own weighted mean, a perfect 1.0, so unrelated reports filed under the
    /// same category would be recommended for grouping.
    ///
    /// Text is folded in only if it does not pull the score below what
    /// proximity and category alone support, so the score never decreases as
    /// text similarity grows.
    pub fn weighted_score(
        &self,
        text: &TextSimilarity,
        proximity: Option<&ProximityResult>,
        category_match: bool,
    ) -> (f64, Vec<GroupingReason>) {
        let cfg = &self.config;
        let mut reasons = Vec::new();
        let mut numerator = 0.0;
        let mut weights_used = 0.0;

        let nearby = proximity.filter(|p| p.is_within_radius);
        let text_clears = text.weighted_score >= cfg.text_similarity_threshold;

        if let Some(p) = nearby {
            numerator += cfg.proximity_weight * self.proximity_score(p);
            weights_used += cfg.proximity_weight;
            reasons.push(GroupingReason::SpatialProximity);
        }

        // Category only corroborates text or proximity; alone it proves nothing
        if category_match && (nearby.is_some() || text_clears) {
            numerator += cfg.category_match_weight;
            weights_used += cfg.category_match_weight;
            reasons.push(GroupingReason::CategoryMatch);
        }

        let base = if weights_used > 0.0 {
            numerator / weights_used
        } else {
            0.0
        };

        let mut score = base;
        if text_clears {
            let total_weight = weights_used + cfg.text_similarity_weight;
            if total_weight > 0.0 {
                let with_text =
                    (numerator + cfg.text_similarity_weight * text.weighted_score) / total_weight;
                score = score.max(with_text);
            }
            reasons.insert(0, GroupingReason::TextualSimilarity);
        }

        (score.clamp(0.0, 1.0), reasons)
    }

    fn proximity_score(&self, p: &ProximityResult) -> f64 {
        let radius = self.config.proximity_radius_meters;
        let fraction = (p.distance_meters / radius).clamp(0.0, 1.0);
        1.0 - (1.0 - PROXIMITY_SCORE_AT_RADIUS) * fraction
    }

    /// Mean of the available per-signal confidence proxies, blended with the score.
    pub fn confidence(&self, signals: &PairSignals, overall_score: f64) -> f64 {
        let mut proxies = vec![signals.text.confidence];

        if let Some(p) = &signals.proximity {
            proxies.push(p.accuracy.confidence());
        }
        proxies.push(if signals.category_match {
            CATEGORY_MATCH_CONFIDENCE
        } else {
            0.0
        });
        proxies.push(if signals.status_compatible {
            STATUS_COMPATIBLE_CONFIDENCE
        } else {
            0.0
        });
        proxies.push(if signals.priority_aligned {
            PRIORITY_ALIGNED_CONFIDENCE
        } else {
            0.0
        });

        let window = self.config.temporal_window_days as f64;
        let temporal = if window > 0.0 {
            (1.0 - signals.temporal_gap_days / window).max(0.0)
        } else if signals.temporal_gap_days == 0.0 {
            1.0
        } else {
            0.0
        };
        proxies.push(temporal);

        let evidence = proxies.iter().sum::<f64>() / proxies.len() as f64;
        (EVIDENCE_CONFIDENCE_SHARE * evidence + SCORE_CONFIDENCE_SHARE * overall_score)
            .clamp(0.0, 1.0)
    }

    pub fn recommend(&self, overall_score: f64, confidence: f64) -> Recommendation {
        let cfg = &self.config;
        if overall_score >= cfg.auto_group_score_threshold
            && confidence >= cfg.auto_group_confidence_threshold
            && !cfg.require_human_review
        {
            Recommendation::Group
        } else if overall_score >= cfg.min_confidence_threshold
            && confidence >= cfg.review_confidence_threshold
        {
            Recommendation::Review
        } else {
            Recommendation::Separate
        }
    }

    /// Analyze every report against every other one. O(n²) pair evaluations:
    /// callers must bound the corpus (the temporal window keeps it tractable).
    pub fn analyze_all(&self, reports: &[Report]) -> AnalyzeAllOutcome {
        let start = Instant::now();
        let mut cache = VectorCache::new();
        let mut outcome = AnalyzeAllOutcome::default();

        for report in reports {
            match self.analyze_with_cache(report, reports, &mut cache) {
                Ok(analysis) => outcome.analyses.push(analysis),
                Err(e) => {
                    warn!("Analysis failed for report {}: {}", report.id, e);
                    outcome.failures.push((report.id.clone(), e));
                }
            }
        }

        let (hits, misses) = cache.stats();
        info!(
            "Analyzed {} reports ({} failed) in {:.2?}; vector cache {} hits / {} misses",
            reports.len(),
            outcome.failures.len(),
            start.elapsed(),
            hits,
            misses
        );
        outcome
    }
}

/// Corpus-wide analysis split across blocking worker tasks.
///
/// Each worker owns a chunk of targets and its own vector cache; results come
/// back in the input order.
pub async fn analyze_all_concurrent(
    analyzer: Arc<GroupingAnalyzer>,
    reports: Arc<Vec<Report>>,
    workers: usize,
) -> AnalyzeAllOutcome {
    let start = Instant::now();
    let total = reports.len();
    if total == 0 {
        return AnalyzeAllOutcome::default();
    }

    let workers = workers.max(1);
    let chunk_size = total.div_ceil(workers);
    let mut tasks = Vec::new();

    for chunk_start in (0..total).step_by(chunk_size) {
        let chunk_end = (chunk_start + chunk_size).min(total);
        let analyzer = Arc::clone(&analyzer);
        let reports = Arc::clone(&reports);

        tasks.push(tokio::task::spawn_blocking(move || {
            let mut cache = VectorCache::new();
            (chunk_start..chunk_end)
                .map(|i| {
                    let report = &reports[i];
                    let result = analyzer.analyze_with_cache(report, &reports, &mut cache);
                    (report.id.clone(), result)
                })
                .collect::<Vec<_>>()
        }));
    }

    let mut outcome = AnalyzeAllOutcome::default();
    for (chunk_index, joined) in futures::future::join_all(tasks).await.into_iter().enumerate() {
        match joined {
            Ok(results) => {
                for (report_id, result) in results {
                    match result {
                        Ok(analysis) => outcome.analyses.push(analysis),
                        Err(e) => outcome.failures.push((report_id, e)),
                    }
                }
            }
            Err(e) => {
                // A panicked worker loses its whole chunk; report every member
                warn!("Error in analysis worker task: {:?}", e);
                let chunk_start = chunk_index * chunk_size;
                let chunk_end = (chunk_start + chunk_size).min(total);
                let message = e.to_string();
                for report in &reports[chunk_start..chunk_end] {
                    outcome.failures.push((
                        report.id.clone(),
                        GroupingError::system(format!("analysis worker failed: {}", message))
                            .with_context(
                                ErrorContext::new("analyzer", "analyze_all_concurrent")
                                    .for_report(&report.id),
                            ),
                    ));
                }
            }
        }
    }

    info!(
        "Concurrent analysis of {} reports using {} workers finished in {:.2?} ({} failed)",
        total,
        workers,
        start.elapsed(),
        outcome.failures.len()
    );
    outcome
}

fn categories_match(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim(), b.trim());
    !a.is_empty() && a.eq_ignore_ascii_case(b)
}

// Descending score, then confidence, then id for a stable order
fn compare_pairs(a: &PairAnalysis, b: &PairAnalysis) -> Ordering {
    b.overall_score
        .partial_cmp(&a.overall_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.candidate_id.cmp(&b.candidate_id))
}

/// Reject report data the scorer cannot work with.
fn validate_report(report: &Report) -> Result<()> {
    if let Some(loc) = &report.location {
        if !loc.is_valid() {
            return Err(GroupingError::processing(format!(
                "report {} has malformed coordinates ({}, {})",
                report.id, loc.latitude, loc.longitude
            ))
            .with_context(ErrorContext::new("analyzer", "analyze").for_report(&report.id)));
        }
    }
    Ok(())
}
