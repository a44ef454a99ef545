// src/grouping/clusters.rs
//
// Corpus-wide group detection:
// 1. Analyze every report against every other one.
// 2. Build an undirected graph with an edge for each pair recommended for grouping.
// 3. Each connected component with more than one report becomes a ReportGroup,
//    with its earliest-created report as primary.

use log::{debug, info, warn};
use petgraph::algo::kosaraju_scc;
use petgraph::prelude::*;
use std::collections::HashMap;
use std::time::Instant;

use crate::config::GroupingConfig;
use crate::error::{GroupingError, Result};
use crate::models::{Report, ReportGroup, ReportId};

use super::analyzer::{AnalyzeAllOutcome, GroupingAnalyzer};
use super::assembly::build_group;
use super::results::{GroupingAnalysis, PairAnalysis, Recommendation};

#[derive(Debug, Default)]
pub struct DetectionOutcome {
    pub groups: Vec<ReportGroup>,
    /// Reports whose analysis failed; they are left ungrouped
    pub failures: Vec<(ReportId, GroupingError)>,
    /// Reports linked into a component that did not make it into its group,
    /// either because the group hit `max_group_size` or because the group
    /// could not be built
    pub overflow: Vec<ReportId>,
}

/// Analyze `reports` and group them.
pub fn detect_groups(analyzer: &GroupingAnalyzer, reports: &[Report]) -> DetectionOutcome {
    let analyzed = analyzer.analyze_all(reports);
    groups_from_analyses(reports, analyzed, analyzer.config())
}

/// Group `reports` using analyses that were already computed for them.
pub fn groups_from_analyses(
    reports: &[Report],
    analyzed: AnalyzeAllOutcome,
    config: &GroupingConfig,
) -> DetectionOutcome {
    let start = Instant::now();
    let AnalyzeAllOutcome { analyses, failures } = analyzed;

    let (graph, pairs) = build_pair_graph(reports, &analyses);
    info!(
        "Pair graph built in {:.2?} with {} nodes and {} edges",
        start.elapsed(),
        graph.node_count(),
        graph.edge_count()
    );

    let components = kosaraju_scc(&graph);
    let mut groups = Vec::new();
    let mut overflow = Vec::new();
    for component in components.into_iter().filter(|c| c.len() > 1) {
        let members: Vec<&Report> = component.iter().map(|&idx| &reports[graph[idx]]).collect();
        match group_component(&members, &pairs, config) {
            Ok(group) => {
                overflow.extend(
                    members
                        .iter()
                        .filter(|m| !group.contains(&m.id))
                        .map(|m| m.id.clone()),
                );
                groups.push(group);
            }
            Err(e) => {
                warn!(
                    "Failed to build group for component of {} reports: {}",
                    members.len(),
                    e
                );
                overflow.extend(members.iter().map(|m| m.id.clone()));
            }
        }
    }
    overflow.sort();
    if !overflow.is_empty() {
        warn!(
            "{} linked reports were left out of their groups (max group size {})",
            overflow.len(),
            config.max_group_size
        );
    }

    groups.sort_by(|a, b| {
        a.metadata
            .created_at
            .cmp(&b.metadata.created_at)
            .then_with(|| a.metadata.primary_report_id.cmp(&b.metadata.primary_report_id))
    });

    info!(
        "Detected {} groups covering {} reports in {:.2?}",
        groups.len(),
        groups.iter().map(|g| g.report_count).sum::<usize>(),
        start.elapsed()
    );
    DetectionOutcome {
        groups,
        failures,
        overflow,
    }
}

type PairKey = (ReportId, ReportId);

/// Nodes carry the index of the report in the input slice.
fn build_pair_graph<'a>(
    reports: &[Report],
    analyses: &'a [GroupingAnalysis],
) -> (UnGraph<usize, ()>, HashMap<PairKey, &'a PairAnalysis>) {
    let mut graph = Graph::new_undirected();
    let mut nodes: HashMap<&ReportId, NodeIndex> = HashMap::new();
    for (i, report) in reports.iter().enumerate() {
        let idx = graph.add_node(i);
        nodes.insert(&report.id, idx);
    }

    let mut pairs = HashMap::new();
    for analysis in analyses {
        let Some(&from) = nodes.get(&analysis.report_id) else {
            continue;
        };
        for pair in analysis
            .matches
            .iter()
            .filter(|m| m.recommendation == Recommendation::Group)
        {
            let Some(&to) = nodes.get(&pair.candidate_id) else {
                continue;
            };
            if !graph.contains_edge(from, to) {
                graph.add_edge(from, to, ());
            }
            pairs.insert((analysis.report_id.clone(), pair.candidate_id.clone()), pair);
        }
    }
    debug!("Added {} grouping edges to the graph", graph.edge_count());
    (graph, pairs)
}

fn group_component(
    members: &[&Report],
    pairs: &HashMap<PairKey, &PairAnalysis>,
    config: &GroupingConfig,
) -> Result<ReportGroup> {
    let primary = members
        .iter()
        .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
        .copied()
        .ok_or_else(|| GroupingError::validation("empty component"))?;

    let mut matched: Vec<(&Report, &PairAnalysis)> = Vec::new();
    for member in members.iter().filter(|m| m.id != primary.id) {
        match admitting_pair(primary, member, members, pairs) {
            Some(pair) => matched.push((*member, pair)),
            None => debug!("No pair analysis admits {} into group of {}", member.id, primary.id),
        }
    }

    build_group(primary, &matched, config)
}

/// The pair analysis that links `member` to the group: its pair with the
/// primary when one exists, otherwise its strongest pair inside the component.
fn admitting_pair<'a>(
    primary: &Report,
    member: &Report,
    members: &[&Report],
    pairs: &HashMap<PairKey, &'a PairAnalysis>,
) -> Option<&'a PairAnalysis> {
    let direct = |a: &ReportId, b: &ReportId| {
        pairs
            .get(&(a.clone(), b.clone()))
            .or_else(|| pairs.get(&(b.clone(), a.clone())))
            .copied()
    };

    if let Some(pair) = direct(&primary.id, &member.id) {
        return Some(pair);
    }
    members
        .iter()
        .filter(|other| other.id != member.id)
        .filter_map(|other| direct(&member.id, &other.id))
        .max_by(|a, b| {
            a.overall_score
                .partial_cmp(&b.overall_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::geospatial::offset_north;
    use crate::models::{Coordinate, Priority, ReportMetadata, ReportStatus, UserId};
    use chrono::{Duration, TimeZone, Utc};

    fn report(id: &str, title: &str, minutes: i64, location: Coordinate) -> Report {
        let created = Utc.with_ymd_and_hms(2024, 9, 2, 7, 30, 0).unwrap() + Duration::minutes(minutes);
        Report {
            id: ReportId::from(id),
            title: title.to_string(),
            description: String::new(),
            category: "Roads".to_string(),
            location: Some(location),
            status: ReportStatus::Open,
            priority: Priority::Medium,
            created_at: created,
            updated_at: created,
            user_id: UserId(format!("user-{}", id)),
            metadata: ReportMetadata::default(),
        }
    }

    #[test]
    fn test_detect_groups_forms_connected_components() {
        let analyzer = GroupingAnalyzer::new(GroupingConfig::default()).unwrap();
        let site_a = Coordinate::new(40.7829, -73.9654);
        let site_b = Coordinate::new(40.7000, -73.9000);
        let reports = vec![
            report("a2", "Deep pothole in left lane", 4, offset_north(&site_a, 3.0)),
            report("a1", "Deep pothole in left lane", 0, site_a),
            report("a3", "Deep pothole in left lane", 9, offset_north(&site_a, 6.0)),
            report("b1", "Fallen tree blocking road", 2, site_b),
            report("b2", "Fallen tree blocking road", 3, offset_north(&site_b, 4.0)),
            report("lonely", "Streetlight out", 1, Coordinate::new(40.6, -73.8)),
        ];

        let outcome = detect_groups(&analyzer, &reports);
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.groups.len(), 2);

        let group_a = outcome
            .groups
            .iter()
            .find(|g| g.contains(&ReportId::from("a1")))
            .unwrap();
        assert_eq!(group_a.metadata.primary_report_id, ReportId::from("a1"));
        assert_eq!(group_a.report_count, 3);

        let group_b = outcome
            .groups
            .iter()
            .find(|g| g.contains(&ReportId::from("b1")))
            .unwrap();
        assert_eq!(group_b.report_count, 2);

        assert!(outcome.groups.iter().all(|g| !g.contains(&ReportId::from("lonely"))));
        assert!(outcome.overflow.is_empty());
    }

    #[test]
    fn test_detect_groups_empty_corpus() {
        let analyzer = GroupingAnalyzer::new(GroupingConfig::default()).unwrap();
        let outcome = detect_groups(&analyzer, &[]);
        assert!(outcome.groups.is_empty());
        assert!(outcome.failures.is_empty());
        assert!(outcome.overflow.is_empty());
    }

    #[test]
    fn test_oversized_component_reports_overflow() {
        let mut config = GroupingConfig::default();
        config.max_group_size = 2;
        let analyzer = GroupingAnalyzer::new(config).unwrap();
        let site = Coordinate::new(51.5072, -0.1276);
        let reports = vec![
            report("first", "Burst water main flooding street", 0, site),
            report("second", "Burst water main flooding street", 1, offset_north(&site, 2.0)),
            report("third", "Burst water main flooding street", 2, offset_north(&site, 4.0)),
        ];

        let outcome = detect_groups(&analyzer, &reports);
        assert_eq!(outcome.groups.len(), 1);
        let group = &outcome.groups[0];
        assert_eq!(group.report_count, 2);
        assert_eq!(group.metadata.primary_report_id, ReportId::from("first"));

        assert_eq!(outcome.overflow.len(), 1);
        assert!(!group.contains(&outcome.overflow[0]));
        let accounted = group.report_count + outcome.overflow.len();
        assert_eq!(accounted, reports.len());
    }

    #[test]
    fn test_component_members_join_through_intermediate_pairs() {
        // a-b and b-c are grouped; a and c are outside each other's radius
        let mut config = GroupingConfig::default();
        config.text_similarity_threshold = 0.99;
        let analyzer = GroupingAnalyzer::new(config).unwrap();
        let origin = Coordinate::new(52.52, 13.405);
        let reports = vec![
            report("a", "Cracked pavement slab outside bakery", 0, origin),
            report("b", "Cracked pavement slab outside pharmacy", 1, offset_north(&origin, 55.0)),
            report("c", "Cracked pavement slab outside library", 2, offset_north(&origin, 110.0)),
        ];

        let outcome = detect_groups(&analyzer, &reports);
        assert_eq!(outcome.groups.len(), 1);
        let group = &outcome.groups[0];
        assert_eq!(group.report_count, 3);
        assert_eq!(group.metadata.primary_report_id, ReportId::from("a"));
    }
}
