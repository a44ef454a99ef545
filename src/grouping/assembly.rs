// src/grouping/assembly.rs
//
// Turns accepted pair analyses into ReportGroups, grows existing groups and
// keeps track of which report belongs to which group.

use chrono::Utc;
use log::{debug, info};
use std::collections::HashMap;

use crate::config::GroupingConfig;
use crate::error::{ErrorContext, GroupingError, Result};
use crate::matching::geospatial::{self, max_distance_from_centroid};
use crate::models::{
    Coordinate, GroupId, GroupLocation, GroupMember, GroupMetadata, Report, ReportGroup, ReportId,
    SimilarityRange,
};

use super::results::{ALGORITHM_VERSION, GroupingAnalysis, PairAnalysis, Recommendation};

/// Assemble a group from a primary report and the reports matched against it.
///
/// Each matched report comes with the pair analysis that admitted it. Members
/// beyond `max_group_size` (primary included) are dropped, lowest score first.
pub fn build_group(
    primary: &Report,
    matched: &[(&Report, &PairAnalysis)],
    config: &GroupingConfig,
) -> Result<ReportGroup> {
    let mut accepted: Vec<(&Report, &PairAnalysis)> = Vec::with_capacity(matched.len());
    for &(report, pair) in matched {
        if report.id == primary.id || accepted.iter().any(|(r, _)| r.id == report.id) {
            continue;
        }
        accepted.push((report, pair));
    }

    if accepted.is_empty() {
        return Err(GroupingError::validation(format!(
            "cannot build a group for report {} without matched reports",
            primary.id
        ))
        .with_context(ErrorContext::new("assembly", "build_group").for_report(&primary.id)));
    }

    accepted.sort_by(|a, b| {
        b.1.overall_score
            .partial_cmp(&a.1.overall_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let capacity = config.max_group_size.saturating_sub(1);
    if accepted.len() > capacity {
        debug!(
            "Group for {} capped at {} members; dropping {} lower-scoring reports",
            primary.id,
            config.max_group_size,
            accepted.len() - capacity
        );
        accepted.truncate(capacity);
    }

    let now = Utc::now();
    let mut members = vec![GroupMember {
        report_id: primary.id.clone(),
        location: primary.location,
        priority: primary.priority,
        confidence: 1.0,
        text_similarity: None,
        joined_at: now,
    }];
    let mut reasons = Vec::new();
    for (report, pair) in &accepted {
        members.push(member_from_pair(report, pair, now));
        reasons.extend(pair.reasons.iter().copied());
    }
    reasons.sort();
    reasons.dedup();

    let mut group = ReportGroup {
        id: GroupId::generate(),
        title: primary.title.clone(),
        description: primary.description.clone(),
        category: primary.category.clone(),
        priority: primary.priority,
        location: None,
        report_ids: Vec::new(),
        report_count: 0,
        average_confidence: 0.0,
        members,
        metadata: GroupMetadata {
            primary_report_id: primary.id.clone(),
            reasons,
            similarity_range: None,
            algorithm_version: ALGORITHM_VERSION.to_string(),
            created_at: now,
            updated_at: now,
        },
    };
    recompute(&mut group, primary.metadata.address.clone())?;

    info!(
        "Built group {} for primary report {} with {} members",
        group.id, primary.id, group.report_count
    );
    Ok(group)
}

/// Add `report` to an existing group.
///
/// `pair` must be a `group` recommendation between `report` and a current
/// member (in either direction). Refuses duplicates and full groups.
pub fn add_to_group(
    group: &mut ReportGroup,
    report: &Report,
    pair: &PairAnalysis,
    config: &GroupingConfig,
) -> Result<()> {
    let context = || {
        ErrorContext::new("assembly", "add_to_group")
            .for_report(&report.id)
            .with_detail("group_id", group.id.to_string())
    };

    if group.contains(&report.id) {
        return Err(GroupingError::validation(format!(
            "report {} is already a member of group {}",
            report.id, group.id
        ))
        .with_context(context()));
    }
    if group.report_count >= config.max_group_size {
        return Err(GroupingError::validation(format!(
            "group {} is full ({} members)",
            group.id, group.report_count
        ))
        .with_context(context()));
    }
    if pair.recommendation != Recommendation::Group {
        return Err(GroupingError::validation(format!(
            "pair analysis for report {} recommends {:?}, not group",
            report.id, pair.recommendation
        ))
        .with_context(context()));
    }
    if !(group.contains(&pair.candidate_id) || pair.candidate_id == report.id) {
        return Err(GroupingError::validation(format!(
            "pair analysis does not relate report {} to a member of group {}",
            report.id, group.id
        ))
        .with_context(context()));
    }

    let now = Utc::now();
    group.members.push(member_from_pair(report, pair, now));
    group.metadata.reasons.extend(pair.reasons.iter().copied());
    group.metadata.reasons.sort();
    group.metadata.reasons.dedup();
    group.metadata.updated_at = now;

    let address = group.location.as_ref().and_then(|l| l.address.clone());
    recompute(group, address)?;

    debug!(
        "Added report {} to group {} ({} members)",
        report.id, group.id, group.report_count
    );
    Ok(())
}

fn member_from_pair(report: &Report, pair: &PairAnalysis, joined_at: chrono::DateTime<Utc>) -> GroupMember {
    GroupMember {
        report_id: report.id.clone(),
        location: report.location,
        priority: report.priority,
        confidence: pair.confidence,
        text_similarity: Some(pair.signals.text.similarity),
        joined_at,
    }
}

/// Refresh every field derived from the member list.
fn recompute(group: &mut ReportGroup, address: Option<String>) -> Result<()> {
    group.report_ids = group.members.iter().map(|m| m.report_id.clone()).collect();
    group.report_count = group.report_ids.len();

    if let Some(max_priority) = group.members.iter().map(|m| m.priority).max() {
        // Priority never drops below what it already was
        group.priority = group.priority.max(max_priority);
    }

    let points: Vec<Coordinate> = group.members.iter().filter_map(|m| m.location).collect();
    group.location = if points.is_empty() {
        None
    } else {
        let centroid = geospatial::centroid(&points)?;
        Some(GroupLocation {
            centroid,
            radius_meters: max_distance_from_centroid(&points, &centroid),
            address,
        })
    };

    let primary = &group.metadata.primary_report_id;
    let admitted: Vec<&GroupMember> = group
        .members
        .iter()
        .filter(|m| &m.report_id != primary)
        .collect();
    group.average_confidence = if admitted.is_empty() {
        1.0
    } else {
        admitted.iter().map(|m| m.confidence).sum::<f64>() / admitted.len() as f64
    };

    group.metadata.similarity_range = admitted
        .iter()
        .filter_map(|m| m.text_similarity)
        .fold(None, |range: Option<SimilarityRange>, s| {
            Some(match range {
                Some(r) => SimilarityRange {
                    min: r.min.min(s),
                    max: r.max.max(s),
                },
                None => SimilarityRange { min: s, max: s },
            })
        });
    Ok(())
}

//------------------------------------------------------------------------------
// MEMBERSHIP INDEX
//------------------------------------------------------------------------------

/// Outcome of applying an analysis to the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupDecision {
    /// A new group was formed around the target
    Created(GroupId),
    /// The target joined the group of one of its matches
    Merged(GroupId),
    /// The target already belongs to this group; nothing changed
    AlreadyGrouped(GroupId),
    /// No `group` recommendation could be acted on
    NoAction,
}

/// In-memory view of groups that enforces "a report belongs to at most one group".
#[derive(Debug, Default)]
pub struct GroupIndex {
    groups: HashMap<GroupId, ReportGroup>,
    membership: HashMap<ReportId, GroupId>,
}

impl GroupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group(&self, id: &GroupId) -> Option<&ReportGroup> {
        self.groups.get(id)
    }

    pub fn group_for(&self, report_id: &ReportId) -> Option<&ReportGroup> {
        self.membership
            .get(report_id)
            .and_then(|id| self.groups.get(id))
    }

    pub fn groups(&self) -> impl Iterator<Item = &ReportGroup> {
        self.groups.values()
    }

    /// Register an existing group. Fails if any member is already grouped.
    pub fn insert(&mut self, group: ReportGroup) -> Result<()> {
        if let Some(taken) = group
            .report_ids
            .iter()
            .find(|id| self.membership.contains_key(*id))
        {
            return Err(GroupingError::validation(format!(
                "report {} already belongs to another group",
                taken
            ))
            .with_context(ErrorContext::new("group_index", "insert").for_report(taken)));
        }
        for id in &group.report_ids {
            self.membership.insert(id.clone(), group.id.clone());
        }
        self.groups.insert(group.id.clone(), group);
        Ok(())
    }

    /// Act on the `group` recommendations in `analysis` for `target`.
    ///
    /// The best match that already sits in a group with room absorbs the
    /// target. Otherwise a new group is formed from the target and its
    /// ungrouped `group` matches, with the earliest-created report as
    /// primary. `candidates` must contain the matched reports.
    pub fn apply(
        &mut self,
        target: &Report,
        analysis: &GroupingAnalysis,
        candidates: &[Report],
        config: &GroupingConfig,
    ) -> Result<GroupDecision> {
        if let Some(existing) = self.membership.get(&target.id) {
            return Ok(GroupDecision::AlreadyGrouped(existing.clone()));
        }

        let group_matches: Vec<&PairAnalysis> = analysis.group_matches().collect();
        if group_matches.is_empty() {
            return Ok(GroupDecision::NoAction);
        }

        // Join an existing group if a strong match is already grouped
        for pair in &group_matches {
            let Some(group_id) = self.membership.get(&pair.candidate_id).cloned() else {
                continue;
            };
            let Some(group) = self.groups.get_mut(&group_id) else {
                continue;
            };
            if group.report_count >= config.max_group_size {
                debug!("Group {} is full; not merging report {}", group_id, target.id);
                continue;
            }
            add_to_group(group, target, pair, config)?;
            self.membership.insert(target.id.clone(), group_id.clone());
            return Ok(GroupDecision::Merged(group_id));
        }

        let by_id: HashMap<&ReportId, &Report> = candidates.iter().map(|r| (&r.id, r)).collect();
        let ungrouped: Vec<(&Report, &PairAnalysis)> = group_matches
            .iter()
            .filter(|p| !self.membership.contains_key(&p.candidate_id))
            .filter_map(|p| by_id.get(&p.candidate_id).map(|r| (*r, *p)))
            .collect();
        if ungrouped.is_empty() {
            return Ok(GroupDecision::NoAction);
        }

        // Earliest report is the original; the target takes over the pair
        // analysis of whichever candidate becomes primary
        let earliest = ungrouped
            .iter()
            .min_by_key(|(r, _)| (r.created_at, r.id.clone()))
            .copied();
        let mut group = match earliest {
            Some((primary, primary_pair)) if primary.created_at < target.created_at => {
                let mut members = vec![(target, primary_pair)];
                members.extend(ungrouped.iter().filter(|(r, _)| r.id != primary.id).copied());
                build_group(primary, &members, config)?
            }
            _ => build_group(target, &ungrouped, config)?,
        };
        if let Some(suggested) = &analysis.suggested_group_id {
            group.id = suggested.clone();
        }

        let group_id = group.id.clone();
        self.insert(group)?;
        Ok(GroupDecision::Created(group_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::results::PairSignals;
    use crate::matching::text::TextSimilarity;
    use crate::models::{GroupingReason, Priority, ReportMetadata, ReportStatus, UserId};
    use crate::matching::geospatial::offset_north;
    use chrono::{Duration, TimeZone};

    fn report(id: &str, minutes: i64, priority: Priority, location: Option<Coordinate>) -> Report {
        let created = Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap() + Duration::minutes(minutes);
        Report {
            id: ReportId::from(id),
            title: format!("Report {}", id),
            description: "Water main burst".to_string(),
            category: "Water".to_string(),
            location,
            status: ReportStatus::Open,
            priority,
            created_at: created,
            updated_at: created,
            user_id: UserId("u".to_string()),
            metadata: ReportMetadata::default(),
        }
    }

    fn pair(candidate: &str, score: f64, confidence: f64, similarity: f64) -> PairAnalysis {
        PairAnalysis {
            candidate_id: ReportId::from(candidate),
            overall_score: score,
            confidence,
            signals: PairSignals {
                text: TextSimilarity {
                    similarity,
                    confidence: similarity,
                    weighted_score: similarity,
                    matched_important_terms: Vec::new(),
                },
                proximity: None,
                category_match: true,
                status_compatible: true,
                priority_aligned: true,
                temporal_gap_days: 0.0,
            },
            recommendation: Recommendation::Group,
            reasons: vec![GroupingReason::CategoryMatch, GroupingReason::TextualSimilarity],
        }
    }

    fn analysis_for(target: &str, matches: Vec<PairAnalysis>) -> GroupingAnalysis {
        GroupingAnalysis {
            report_id: ReportId::from(target),
            matches,
            suggested_group_id: None,
            metadata: crate::grouping::results::AnalysisMetadata {
                analyzed_at: Utc::now(),
                algorithm_version: ALGORITHM_VERSION.to_string(),
                processing_time_ms: 0.0,
                candidates_received: 0,
                candidates_compared: 0,
            },
        }
    }

    #[test]
    fn test_build_group_merges_members() {
        let origin = Coordinate::new(51.5, -0.12);
        let mut primary = report("p", 0, Priority::Low, Some(origin));
        primary.metadata.address = Some("1 High St".to_string());
        let a = report("a", 5, Priority::Urgent, Some(offset_north(&origin, 40.0)));
        let b = report("b", 9, Priority::Medium, None);
        let pa = pair("a", 0.9, 0.8, 0.75);
        let pb = pair("b", 0.95, 0.9, 0.95);

        let group = build_group(&primary, &[(&a, &pa), (&b, &pb)], &GroupingConfig::default()).unwrap();

        assert_eq!(group.title, "Report p");
        assert_eq!(group.category, "Water");
        assert_eq!(group.priority, Priority::Urgent);
        assert_eq!(group.report_count, group.report_ids.len());
        assert_eq!(group.report_count, 3);
        assert!((group.average_confidence - 0.85).abs() < 1e-12);
        assert_eq!(group.metadata.similarity_range, Some(SimilarityRange { min: 0.75, max: 0.95 }));
        assert_eq!(
            group.metadata.reasons,
            vec![GroupingReason::TextualSimilarity, GroupingReason::CategoryMatch]
        );

        let location = group.location.unwrap();
        assert!((location.radius_meters - 20.0).abs() < 0.01);
        assert_eq!(location.address.as_deref(), Some("1 High St"));
    }

    #[test]
    fn test_build_group_requires_matches() {
        let primary = report("p", 0, Priority::Low, None);
        let self_pair = pair("p", 1.0, 1.0, 1.0);
        let err = build_group(&primary, &[(&primary, &self_pair)], &GroupingConfig::default())
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_build_group_caps_at_max_size() {
        let mut config = GroupingConfig::default();
        config.max_group_size = 3;
        let primary = report("p", 0, Priority::Low, None);
        let reports: Vec<Report> = (0..4).map(|i| report(&format!("m{}", i), i, Priority::Low, None)).collect();
        let pairs: Vec<PairAnalysis> = (0..4)
            .map(|i| pair(&format!("m{}", i), 0.86 + i as f64 * 0.01, 0.9, 0.8))
            .collect();
        let matched: Vec<(&Report, &PairAnalysis)> = reports.iter().zip(pairs.iter()).collect();

        let group = build_group(&primary, &matched, &config).unwrap();
        assert_eq!(group.report_count, 3);
        assert!(group.contains(&ReportId::from("m3")));
        assert!(group.contains(&ReportId::from("m2")));
        assert!(!group.contains(&ReportId::from("m0")));
    }

    #[test]
    fn test_add_to_group_keeps_priority_monotonic() {
        let config = GroupingConfig::default();
        let primary = report("p", 0, Priority::High, None);
        let a = report("a", 1, Priority::Low, None);
        let pa = pair("a", 0.9, 0.9, 0.9);
        let mut group = build_group(&primary, &[(&a, &pa)], &config).unwrap();

        let c = report("c", 2, Priority::Low, None);
        let pc = pair("a", 0.9, 0.7, 0.6);
        add_to_group(&mut group, &c, &pc, &config).unwrap();

        assert_eq!(group.priority, Priority::High);
        assert_eq!(group.report_count, 3);
        assert!((group.average_confidence - 0.8).abs() < 1e-12);
        assert_eq!(group.metadata.similarity_range, Some(SimilarityRange { min: 0.6, max: 0.9 }));

        let err = add_to_group(&mut group, &c, &pc, &config).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(group.report_count, 3);
    }

    #[test]
    fn test_add_to_group_rejects_unrelated_or_weak_pairs() {
        let config = GroupingConfig::default();
        let primary = report("p", 0, Priority::Low, None);
        let a = report("a", 1, Priority::Low, None);
        let pa = pair("a", 0.9, 0.9, 0.9);
        let mut group = build_group(&primary, &[(&a, &pa)], &config).unwrap();

        let c = report("c", 2, Priority::Low, None);
        assert!(add_to_group(&mut group, &c, &pair("stranger", 0.9, 0.9, 0.9), &config).is_err());

        let mut weak = pair("a", 0.7, 0.7, 0.7);
        weak.recommendation = Recommendation::Review;
        assert!(add_to_group(&mut group, &c, &weak, &config).is_err());
        assert_eq!(group.report_count, 2);
    }

    #[test]
    fn test_index_creates_then_merges() {
        let config = GroupingConfig::default();
        let first = report("first", 0, Priority::Medium, None);
        let second = report("second", 10, Priority::Medium, None);
        let third = report("third", 20, Priority::Medium, None);
        let corpus = vec![first.clone(), second.clone(), third.clone()];
        let mut index = GroupIndex::new();

        // "second" arrives and matches the older "first"
        let decision = index
            .apply(&second, &analysis_for("second", vec![pair("first", 0.9, 0.9, 0.9)]), &corpus, &config)
            .unwrap();
        let GroupDecision::Created(group_id) = decision else {
            panic!("expected a new group, got {:?}", decision);
        };
        let group = index.group(&group_id).unwrap();
        assert_eq!(group.metadata.primary_report_id, first.id);
        assert_eq!(group.title, "Report first");

        // "third" matches "second", which is already grouped
        let decision = index
            .apply(&third, &analysis_for("third", vec![pair("second", 0.9, 0.9, 0.9)]), &corpus, &config)
            .unwrap();
        assert_eq!(decision, GroupDecision::Merged(group_id.clone()));
        assert_eq!(index.group_for(&third.id).unwrap().report_count, 3);
        assert_eq!(index.len(), 1);

        let decision = index
            .apply(&third, &analysis_for("third", vec![pair("first", 0.9, 0.9, 0.9)]), &corpus, &config)
            .unwrap();
        assert_eq!(decision, GroupDecision::AlreadyGrouped(group_id));
    }

    #[test]
    fn test_index_ignores_non_group_recommendations() {
        let config = GroupingConfig::default();
        let a = report("a", 0, Priority::Low, None);
        let b = report("b", 1, Priority::Low, None);
        let mut review = pair("a", 0.7, 0.7, 0.7);
        review.recommendation = Recommendation::Review;
        let mut index = GroupIndex::new();
        let decision = index
            .apply(&b, &analysis_for("b", vec![review]), &[a, b.clone()], &config)
            .unwrap();
        assert_eq!(decision, GroupDecision::NoAction);
        assert!(index.is_empty());
    }

    #[test]
    fn test_index_insert_enforces_single_membership() {
        let config = GroupingConfig::default();
        let p = report("p", 0, Priority::Low, None);
        let a = report("a", 1, Priority::Low, None);
        let b = report("b", 2, Priority::Low, None);
        let pa = pair("a", 0.9, 0.9, 0.9);
        let pp = pair("p", 0.9, 0.9, 0.9);

        let mut index = GroupIndex::new();
        index.insert(build_group(&p, &[(&a, &pa)], &config).unwrap()).unwrap();
        let overlapping = build_group(&b, &[(&p, &pp)], &config).unwrap();
        assert!(index.insert(overlapping).is_err());
        assert_eq!(index.len(), 1);
    }
}
